//! Reconciliation of diverging peer views.
//!
//! This is a best-effort heuristic for benign but lossy networks. It is not a
//! consensus protocol and gives no guarantee against a peer that lies about
//! its own state.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::ledger::types::{GameId, PeerId};

/// What a peer advertises about its local game state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSummary {
    pub game_id: GameId,
    pub peer_id: PeerId,
    pub turn: u32,
    pub last_action_time: Option<Timestamp>,
    pub action_count: usize,
    pub log_head: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    AdoptRemote,
}

pub trait StateConflictResolver: Send + Sync {
    fn resolve(&self, local: &StateSummary, remote: &StateSummary) -> Resolution;
}

/// Higher turn wins, then the later last action, then the longer history.
/// Ties keep the local view.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStateConflictResolver;

impl StateConflictResolver for DefaultStateConflictResolver {
    fn resolve(&self, local: &StateSummary, remote: &StateSummary) -> Resolution {
        let local_key = (
            local.turn,
            local.last_action_time.unwrap_or(0),
            local.action_count,
        );
        let remote_key = (
            remote.turn,
            remote.last_action_time.unwrap_or(0),
            remote.action_count,
        );
        if remote_key > local_key {
            Resolution::AdoptRemote
        } else {
            Resolution::KeepLocal
        }
    }
}

impl StateSummary {
    /// Two summaries describe the same history when their log heads agree.
    pub fn same_history(&self, other: &StateSummary) -> bool {
        self.game_id == other.game_id && self.log_head == other.log_head
    }
}
