use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::types::{ActionId, PeerId};

/// Why a single action was refused. Each variant names the offending action or peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("action {action_id} carries no signature")]
    MissingSignature { action_id: ActionId },

    #[error("action {action_id} has a malformed signature: {reason}")]
    MalformedSignature { action_id: ActionId, reason: String },

    #[error("replay detected: action id {action_id} was already accepted")]
    Replay { action_id: ActionId },

    #[error("action {action_id} timestamp is {skew_ms}ms away from local time")]
    Stale { action_id: ActionId, skew_ms: i64 },

    #[error("invalid signature on action {action_id}")]
    BadSignature { action_id: ActionId },

    #[error("unregistered peer {peer_id}")]
    UnregisteredPeer { peer_id: PeerId },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl VerifyError {
    pub fn is_replay(&self) -> bool {
        matches!(self, VerifyError::Replay { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, VerifyError::Stale { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakReason {
    PreviousHashMismatch,
    InvalidSignature,
    MalformedEntry,
    /// The entry itself checks out but sits after an earlier break.
    FollowsBreak,
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            BreakReason::PreviousHashMismatch => "Previous hash mismatch",
            BreakReason::InvalidSignature => "Invalid signature",
            BreakReason::MalformedEntry => "Malformed entry",
            BreakReason::FollowsBreak => "Follows an earlier break",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("action {action_id} must be signed before logging")]
    UnsignedAction { action_id: ActionId },

    #[error("invalid log chain at entry {index}: {reason}")]
    Broken { index: usize, reason: BreakReason },

    #[error("log head mismatch: export claims {claimed}, chain hashes to {actual}")]
    HeadMismatch { claimed: String, actual: String },

    #[error("log serialization failed: {0}")]
    Serialization(String),
}
