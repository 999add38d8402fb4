use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::clock::{SharedClock, Timestamp};
use crate::config::FairnessConfig;
use crate::game::{ActionDraft, GameAction};
use crate::keys::{SigningKeyPair, SigningPublicKey};
use crate::ledger::error::VerifyError;
use crate::ledger::replay::ReplayGuard;
use crate::ledger::types::ActionId;
use crate::signing::{Signable, TranscriptBuilder};

const LOG_TARGET: &str = "legit_mahjong::ledger::signature";

/// Free-form message signed together with its timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    pub message: String,
    pub signature: String,
    pub public_key: SigningPublicKey,
    pub timestamp: Timestamp,
}

struct MessageTranscript<'a> {
    message: &'a str,
    timestamp: Timestamp,
}

impl Signable for MessageTranscript<'_> {
    fn domain_kind(&self) -> &'static str {
        "signed_message_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        builder.append_str(self.message);
        builder.append_i64(self.timestamp);
    }
}

/// Signs outgoing actions and checks incoming ones against a replay window
/// and a clock tolerance. One instance per game session.
pub struct SignatureService {
    replay: Mutex<ReplayGuard>,
    clock: SharedClock,
    tolerance_ms: i64,
}

impl SignatureService {
    pub fn new(config: &FairnessConfig, clock: SharedClock) -> Self {
        Self {
            replay: Mutex::new(ReplayGuard::new(config.replay_capacity)),
            clock,
            tolerance_ms: config.timestamp_tolerance_ms,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    /// Fills in a missing id (UUID v4) and timestamp, then signs every field
    /// except the signature.
    #[instrument(skip(self, draft, key), fields(peer_id = %draft.peer_id), level = "trace")]
    pub fn sign(&self, draft: ActionDraft, key: &SigningKeyPair) -> GameAction {
        let mut action = GameAction {
            id: draft
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            action_type: draft.action_type,
            peer_id: draft.peer_id,
            timestamp: draft.timestamp.unwrap_or_else(|| self.now()),
            data: draft.data,
            signature: None,
        };
        action.signature = Some(action.sign_with(key));
        debug!(
            target: LOG_TARGET,
            action_id = %action.id,
            action_type = action.action_type.as_str(),
            "signed action"
        );
        action
    }

    /// Full check: signature present, id not replayed, timestamp within
    /// tolerance, signature valid. Only a passing action enters the replay window.
    pub fn verify(&self, action: &GameAction, key: &SigningPublicKey) -> Result<(), VerifyError> {
        let result = self.check(action, key);
        if let Err(err) = &result {
            warn!(
                target: LOG_TARGET,
                action_id = %action.id,
                peer_id = %action.peer_id,
                error = %err,
                "action rejected"
            );
        }
        result
    }

    fn check(&self, action: &GameAction, key: &SigningPublicKey) -> Result<(), VerifyError> {
        if action.signature.is_none() {
            return Err(VerifyError::MissingSignature {
                action_id: action.id.clone(),
            });
        }
        if self.replay.lock().contains(&action.id) {
            return Err(VerifyError::Replay {
                action_id: action.id.clone(),
            });
        }
        let skew_ms = self.now() - action.timestamp;
        if skew_ms.abs() > self.tolerance_ms {
            return Err(VerifyError::Stale {
                action_id: action.id.clone(),
                skew_ms,
            });
        }
        action.verify_signature(key)?;

        if !self.replay.lock().insert(action.id.clone()) {
            // lost a race with a concurrent verify of the same id
            return Err(VerifyError::Replay {
                action_id: action.id.clone(),
            });
        }
        Ok(())
    }

    /// Signature only, leaving the replay window and clock out of it.
    pub fn verify_signature_only(
        &self,
        action: &GameAction,
        key: &SigningPublicKey,
    ) -> Result<(), VerifyError> {
        action.verify_signature(key)
    }

    pub fn sign_message(&self, message: impl Into<String>, key: &SigningKeyPair) -> SignedMessage {
        let message = message.into();
        let timestamp = self.now();
        let signature = MessageTranscript {
            message: &message,
            timestamp,
        }
        .sign_with(key);
        SignedMessage {
            message,
            signature,
            public_key: key.public_key(),
            timestamp,
        }
    }

    pub fn verify_message(&self, signed: &SignedMessage) -> Result<(), VerifyError> {
        let skew_ms = self.now() - signed.timestamp;
        if skew_ms.abs() > self.tolerance_ms {
            return Err(VerifyError::InvalidMessage(format!(
                "message timestamp is {skew_ms}ms away from local time"
            )));
        }
        MessageTranscript {
            message: &signed.message,
            timestamp: signed.timestamp,
        }
        .verify_with(&signed.public_key, &signed.signature)
        .map_err(|err| VerifyError::InvalidMessage(err.to_string()))
    }

    pub fn replay_window_len(&self) -> usize {
        self.replay.lock().len()
    }

    /// Seeds the replay window with ids accepted elsewhere, e.g. from an imported log.
    pub fn mark_seen<I>(&self, ids: I)
    where
        I: IntoIterator<Item = ActionId>,
    {
        let mut replay = self.replay.lock();
        for id in ids {
            replay.insert(id);
        }
    }

    pub fn reset_replay_window(&self) {
        self.replay.lock().clear();
    }
}
