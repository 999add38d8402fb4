//! Crate-level error that every subsystem error converts into.

use thiserror::Error;

use crate::encryption::CryptoError;
use crate::ledger::{ChainError, VerifyError};
use crate::postgame::PostGameError;
use crate::session::TransportError;
use crate::shuffling::ShuffleError;
use crate::tiles::CompositionError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FairnessError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Shuffle(#[from] ShuffleError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error(transparent)]
    PostGame(#[from] PostGameError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Coarse category used when reporting a failure to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Cryptographic,
    Replay,
    Staleness,
    ChainIntegrity,
    Composition,
    StateConsistency,
    Verification,
    Transport,
}

impl FairnessError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FairnessError::Configuration(_) => ErrorKind::Configuration,
            FairnessError::Crypto(_) => ErrorKind::Cryptographic,
            FairnessError::Shuffle(err) => shuffle_kind(err),
            FairnessError::Verify(err) if err.is_replay() => ErrorKind::Replay,
            FairnessError::Verify(err) if err.is_stale() => ErrorKind::Staleness,
            FairnessError::Verify(VerifyError::Chain(_)) => ErrorKind::ChainIntegrity,
            FairnessError::Verify(_) => ErrorKind::Verification,
            FairnessError::Chain(_) => ErrorKind::ChainIntegrity,
            FairnessError::Composition(_) => ErrorKind::Composition,
            FairnessError::PostGame(err) => match err {
                PostGameError::WrongPhase { .. } => ErrorKind::Configuration,
                PostGameError::Shuffle(err) => shuffle_kind(err),
                PostGameError::Composition(_) => ErrorKind::Composition,
                PostGameError::Chain(_) => ErrorKind::ChainIntegrity,
                PostGameError::Crypto(_) => ErrorKind::Cryptographic,
                PostGameError::StateConsistency(_) => ErrorKind::StateConsistency,
                _ => ErrorKind::Verification,
            },
            FairnessError::Transport(_) => ErrorKind::Transport,
        }
    }
}

/// Turn-order and setup mistakes are configuration errors; a bad deck from
/// another peer is a verification failure.
fn shuffle_kind(err: &ShuffleError) -> ErrorKind {
    match err {
        ShuffleError::InvalidPeerCount { .. }
        | ShuffleError::DuplicatePeer(_)
        | ShuffleError::NotInitialized
        | ShuffleError::AlreadyInitialized
        | ShuffleError::OutOfTurn { .. }
        | ShuffleError::Complete
        | ShuffleError::Aborted(_) => ErrorKind::Configuration,
        ShuffleError::Crypto(_) => ErrorKind::Cryptographic,
        ShuffleError::UnknownPeer(_)
        | ShuffleError::InvalidDeckSize { .. }
        | ShuffleError::InvalidRemoteDeck(_) => ErrorKind::Verification,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgame::VerificationPhase;

    #[test]
    fn kinds_follow_the_underlying_failure() {
        let replay = FairnessError::from(VerifyError::Replay {
            action_id: "a-1".into(),
        });
        assert_eq!(replay.kind(), ErrorKind::Replay);

        let stale = FairnessError::from(VerifyError::Stale {
            action_id: "a-2".into(),
            skew_ms: 400_000,
        });
        assert_eq!(stale.kind(), ErrorKind::Staleness);

        let shuffle_crypto = FairnessError::from(ShuffleError::Crypto(CryptoError::KeyAgreement));
        assert_eq!(shuffle_crypto.kind(), ErrorKind::Cryptographic);

        for setup in [
            ShuffleError::InvalidPeerCount {
                min: 3,
                max: 4,
                actual: 5,
            },
            ShuffleError::OutOfTurn {
                expected: "east".into(),
                actual: "west".into(),
            },
            ShuffleError::AlreadyInitialized,
            ShuffleError::NotInitialized,
            ShuffleError::DuplicatePeer("south".into()),
            ShuffleError::Complete,
            ShuffleError::Aborted("timeout".into()),
        ] {
            assert_eq!(
                FairnessError::from(setup.clone()).kind(),
                ErrorKind::Configuration,
                "{setup:?}"
            );
        }
        assert_eq!(
            FairnessError::from(ShuffleError::remote("ids do not match")).kind(),
            ErrorKind::Verification
        );
        assert_eq!(
            FairnessError::from(ShuffleError::UnknownPeer("north".into())).kind(),
            ErrorKind::Verification
        );

        let reinit = FairnessError::from(PostGameError::WrongPhase {
            expected: VerificationPhase::Idle,
            actual: VerificationPhase::CollectingKeys,
        });
        assert_eq!(reinit.kind(), ErrorKind::Configuration);

        let postgame = FairnessError::from(PostGameError::StateConsistency("scores".into()));
        assert_eq!(postgame.kind(), ErrorKind::StateConsistency);

        assert_eq!(
            FairnessError::config("bad").to_string(),
            "configuration error: bad"
        );
        assert_eq!(
            FairnessError::from(TransportError::Closed).kind(),
            ErrorKind::Transport
        );
    }
}
