use thiserror::Error;

use crate::encryption::CryptoError;
use crate::ledger::types::PeerId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShuffleError {
    #[error("invalid peer count: expected {min}..={max}, got {actual}")]
    InvalidPeerCount {
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("peer {0} appears more than once")]
    DuplicatePeer(PeerId),

    #[error("peer {0} is not a shuffle participant")]
    UnknownPeer(PeerId),

    #[error("deck has not been initialized")]
    NotInitialized,

    #[error("deck is already initialized")]
    AlreadyInitialized,

    #[error("out of turn: expected {expected}, got {actual}")]
    OutOfTurn { expected: PeerId, actual: PeerId },

    #[error("every participant has already shuffled")]
    Complete,

    #[error("shuffle aborted: {0}")]
    Aborted(String),

    #[error("invalid deck size: expected {expected}, got {actual}")]
    InvalidDeckSize { expected: usize, actual: usize },

    #[error("invalid remote deck: {0}")]
    InvalidRemoteDeck(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ShuffleError {
    pub(crate) fn remote(reason: impl Into<String>) -> Self {
        Self::InvalidRemoteDeck(reason.into())
    }
}
