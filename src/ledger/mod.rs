//! Signed actions, the replay window, the hash-chained log and live verification.

pub mod action_log;
mod error;
pub mod hash;
pub mod replay;
pub mod signature;
pub mod types;
pub mod verifier;

pub use action_log::{ActionLog, ActionLogEntry, ActionLogExport, ChainBreak, ChainReport};
pub use error::{BreakReason, ChainError, VerifyError};
pub use replay::ReplayGuard;
pub use signature::{SignatureService, SignedMessage};
pub use types::{ActionId, GameId, PeerId, StateHash, GENESIS_HASH};
pub use verifier::{
    GameVerificationReport, InvalidActionRecord, SequenceReport, VerificationDataExport,
    VerificationEvent, VerificationManager,
};
