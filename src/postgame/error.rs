use thiserror::Error;

use super::state::VerificationPhase;
use crate::encryption::CryptoError;
use crate::ledger::types::{GameId, PeerId};
use crate::ledger::ChainError;
use crate::shuffling::ShuffleError;
use crate::tiles::CompositionError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PostGameError {
    #[error("expected phase {expected:?}, currently {actual:?}")]
    WrongPhase {
        expected: VerificationPhase,
        actual: VerificationPhase,
    },

    #[error("disclosure is for game {actual}, expected {expected}")]
    GameMismatch { expected: GameId, actual: GameId },

    #[error("peer {0} is not seated in this game")]
    UnknownPeer(PeerId),

    #[error("invalid key disclosure signature from {0}")]
    BadDisclosureSignature(PeerId),

    #[error("disclosed key from {0} does not match the announced encryption key")]
    KeyMismatch(PeerId),

    #[error("peer {0} already disclosed a different key")]
    ConflictingDisclosure(PeerId),

    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error("inconsistent final state: {0}")]
    StateConsistency(String),

    #[error("deck history rejected: {0}")]
    Shuffle(#[from] ShuffleError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("verification aborted: {0}")]
    Aborted(String),
}
