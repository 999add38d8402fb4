use serde::{Deserialize, Serialize};

use super::report::VerificationResult;
use crate::ledger::types::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationPhase {
    Idle,
    CollectingKeys,
    Verifying,
    Completed,
    Failed,
}

impl VerificationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Phases only ever move forward.
    pub(crate) fn can_advance_to(self, next: VerificationPhase) -> bool {
        use VerificationPhase::*;
        matches!(
            (self, next),
            (Idle, CollectingKeys)
                | (CollectingKeys, Verifying)
                | (Verifying, Completed)
                | (Idle | CollectingKeys | Verifying, Failed)
        )
    }
}

/// Snapshot of the pipeline. Collected keys are listed by peer only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostGameState {
    pub phase: VerificationPhase,
    pub progress: u8,
    pub current_step: String,
    pub collected_keys: Vec<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for PostGameState {
    fn default() -> Self {
        Self {
            phase: VerificationPhase::Idle,
            progress: 0,
            current_step: String::new(),
            collected_keys: Vec::new(),
            verification_result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PostGameEvent {
    StateChanged(VerificationPhase),
    KeyReceived { peer_id: PeerId },
    Progress { progress: u8, step: String },
    Completed(Box<VerificationResult>),
    Failed { error: String },
}
