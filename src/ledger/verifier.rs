use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::clock::{SharedClock, Timestamp};
use crate::config::FairnessConfig;
use crate::crypto_serde::array_map;
use crate::game::GameAction;
use crate::keys::{PeerPublicKeys, SigningPublicKey};
use crate::ledger::action_log::{ActionLog, ActionLogEntry, ActionLogExport};
use crate::ledger::error::{ChainError, VerifyError};
use crate::ledger::signature::SignatureService;
use crate::ledger::types::{ActionId, GameId, PeerId};

const LOG_TARGET: &str = "legit_mahjong::ledger::verifier";
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidActionRecord {
    pub action_id: ActionId,
    pub peer_id: PeerId,
    pub reason: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationEvent {
    PeerRegistered { peer_id: PeerId },
    ActionAccepted { action_id: ActionId, peer_id: PeerId },
    ActionRejected(InvalidActionRecord),
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameVerificationReport {
    pub game_id: GameId,
    pub valid: bool,
    pub total_actions: usize,
    pub valid_actions: usize,
    pub invalid_actions: Vec<ActionId>,
    pub errors: Vec<String>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceReport {
    pub valid: bool,
    pub accepted: Vec<ActionId>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDataExport {
    pub game_id: GameId,
    #[serde(with = "array_map")]
    pub peer_keys: BTreeMap<PeerId, SigningPublicKey>,
    pub invalid_actions: Vec<InvalidActionRecord>,
    pub logs: ActionLogExport,
    pub timestamp: Timestamp,
}

/// Live, per-game verification: key registry, signature and replay checks,
/// and the hash-chained log of everything accepted.
pub struct VerificationManager {
    game_id: GameId,
    clock: SharedClock,
    registry: DashMap<PeerId, SigningPublicKey>,
    signatures: SignatureService,
    log: RwLock<ActionLog>,
    invalid: RwLock<Vec<InvalidActionRecord>>,
    events: broadcast::Sender<VerificationEvent>,
}

impl VerificationManager {
    pub fn new(game_id: impl Into<GameId>, config: &FairnessConfig, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            game_id: game_id.into(),
            signatures: SignatureService::new(config, clock.clone()),
            clock,
            registry: DashMap::new(),
            log: RwLock::new(ActionLog::new()),
            invalid: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn signatures(&self) -> &SignatureService {
        &self.signatures
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VerificationEvent> {
        self.events.subscribe()
    }

    pub fn register_peer(&self, peer_id: impl Into<PeerId>, key: SigningPublicKey) {
        let peer_id = peer_id.into();
        info!(
            target: LOG_TARGET,
            game_id = %self.game_id,
            peer_id = %peer_id,
            fingerprint = %key.fingerprint(),
            "registered peer signing key"
        );
        self.registry.insert(peer_id.clone(), key);
        let _ = self.events.send(VerificationEvent::PeerRegistered { peer_id });
    }

    pub fn register_peers<'a, I>(&self, peers: I)
    where
        I: IntoIterator<Item = &'a PeerPublicKeys>,
    {
        for peer in peers {
            self.register_peer(peer.peer_id.clone(), peer.signing_key);
        }
    }

    pub fn peer_key(&self, peer_id: &str) -> Option<SigningPublicKey> {
        self.registry.get(peer_id).map(|entry| *entry.value())
    }

    /// Verifies an incoming action and logs it on success. Failures are recorded
    /// against the action id and returned, never dropped.
    #[instrument(skip(self, action), fields(action_id = %action.id), level = "trace")]
    pub fn verify_and_log_action(&self, action: &GameAction) -> Result<(), VerifyError> {
        let outcome = self.peer_key(&action.peer_id)
            .ok_or_else(|| VerifyError::UnregisteredPeer {
                peer_id: action.peer_id.clone(),
            })
            .and_then(|key| {
                self.signatures.verify(action, &key)?;
                self.log.write().append(action, key)?;
                Ok(())
            });

        match &outcome {
            Ok(()) => {
                let _ = self.events.send(VerificationEvent::ActionAccepted {
                    action_id: action.id.clone(),
                    peer_id: action.peer_id.clone(),
                });
            }
            Err(err) => self.record_invalid(action, err),
        }
        outcome
    }

    fn record_invalid(&self, action: &GameAction, err: &VerifyError) {
        let record = InvalidActionRecord {
            action_id: action.id.clone(),
            peer_id: action.peer_id.clone(),
            reason: err.to_string(),
            timestamp: self.clock.now_millis(),
        };
        warn!(
            target: LOG_TARGET,
            game_id = %self.game_id,
            action_id = %record.action_id,
            peer_id = %record.peer_id,
            reason = %record.reason,
            "invalid action recorded"
        );
        self.invalid.write().push(record.clone());
        let _ = self.events.send(VerificationEvent::ActionRejected(record));
    }

    /// Verifies and logs each action in order. A failure does not stop the batch.
    pub fn verify_action_sequence<'a, I>(&self, actions: I) -> SequenceReport
    where
        I: IntoIterator<Item = &'a GameAction>,
    {
        let mut accepted = Vec::new();
        let mut errors = Vec::new();
        for action in actions {
            match self.verify_and_log_action(action) {
                Ok(()) => accepted.push(action.id.clone()),
                Err(err) => errors.push(format!("Action {}: {err}", action.id)),
            }
        }
        SequenceReport {
            valid: errors.is_empty(),
            accepted,
            errors,
        }
    }

    /// Re-checks every logged entry against the registry and the chain.
    /// Uses signature-only verification so already accepted ids do not read as replays.
    pub fn verify_game_complete(&self) -> GameVerificationReport {
        let log = self.log.read();
        let chain = log.verify_chain();
        let mut errors = chain.messages();
        let mut invalid_actions = Vec::new();
        let mut valid_actions = 0;

        for entry in log.entries() {
            match self.reverify_entry(entry) {
                Ok(()) => valid_actions += 1,
                Err(message) => {
                    invalid_actions.push(entry.id.clone());
                    errors.push(message);
                }
            }
        }

        let total_actions = log.len();
        let valid = chain.valid && valid_actions == total_actions;
        info!(
            target: LOG_TARGET,
            game_id = %self.game_id,
            total_actions,
            valid_actions,
            valid,
            "whole-game verification finished"
        );
        GameVerificationReport {
            game_id: self.game_id.clone(),
            valid,
            total_actions,
            valid_actions,
            invalid_actions,
            errors,
            timestamp: self.clock.now_millis(),
        }
    }

    fn reverify_entry(&self, entry: &ActionLogEntry) -> Result<(), String> {
        let action = entry
            .decode_action()
            .map_err(|err| format!("Action {}: malformed entry: {err}", entry.id))?;
        let key = self
            .peer_key(&action.peer_id)
            .ok_or_else(|| format!("No public key for peer {}", action.peer_id))?;
        if key != entry.public_key {
            return Err(format!(
                "Action {}: logged key does not match peer {}",
                action.id, action.peer_id
            ));
        }
        self.signatures
            .verify_signature_only(&action, &key)
            .map_err(|err| format!("Action {}: {err}", action.id))
    }

    pub fn is_action_valid(&self, action_id: &str) -> bool {
        !self
            .invalid
            .read()
            .iter()
            .any(|record| record.action_id == action_id)
    }

    pub fn invalid_actions(&self) -> Vec<InvalidActionRecord> {
        self.invalid.read().clone()
    }

    pub fn log_len(&self) -> usize {
        self.log.read().len()
    }

    pub fn log_head(&self) -> String {
        self.log.read().head().to_string()
    }

    pub fn last_action_time(&self) -> Option<Timestamp> {
        self.log.read().entries().last().map(|entry| entry.timestamp)
    }

    pub fn export_log(&self) -> ActionLogExport {
        self.log.read().export(self.clock.now_millis())
    }

    pub fn logged_actions(&self) -> Vec<GameAction> {
        self.log
            .read()
            .entries()
            .iter()
            .filter_map(|entry| entry.decode_action().ok())
            .collect()
    }

    pub fn clear_state(&self) {
        self.registry.clear();
        self.invalid.write().clear();
        self.log.write().clear();
        self.signatures.reset_replay_window();
        info!(target: LOG_TARGET, game_id = %self.game_id, "verification state cleared");
        let _ = self.events.send(VerificationEvent::Cleared);
    }

    pub fn export_verification_data(&self) -> VerificationDataExport {
        let peer_keys = self
            .registry
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        VerificationDataExport {
            game_id: self.game_id.clone(),
            peer_keys,
            invalid_actions: self.invalid_actions(),
            logs: self.export_log(),
            timestamp: self.clock.now_millis(),
        }
    }

    /// Replaces local state with an export. The log chain must verify first;
    /// on failure nothing is changed.
    pub fn import_verification_data(&self, data: VerificationDataExport) -> Result<(), ChainError> {
        let log = ActionLog::import(data.logs)?;
        self.registry.clear();
        for (peer_id, key) in data.peer_keys {
            self.registry.insert(peer_id, key);
        }
        self.signatures.reset_replay_window();
        self.signatures
            .mark_seen(log.entries().iter().map(|entry| entry.id.clone()));
        *self.invalid.write() = data.invalid_actions;
        *self.log.write() = log;
        info!(
            target: LOG_TARGET,
            game_id = %self.game_id,
            entries = self.log_len(),
            "verification data imported"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{signed_draws, TestTable};

    fn manager(table: &TestTable) -> VerificationManager {
        let manager = VerificationManager::new("game-1", &table.config, table.clock.clone());
        manager.register_peers(table.announcements().iter());
        manager
    }

    #[test]
    fn ten_signed_actions_all_verify() {
        let table = TestTable::new(4, 41);
        let manager = manager(&table);
        let actions = signed_draws(&table, 0, 10);
        let report = manager.verify_action_sequence(actions.iter());
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.accepted.len(), 10);

        let report = manager.verify_game_complete();
        assert!(report.valid);
        assert_eq!(report.total_actions, 10);
        assert_eq!(report.valid_actions, 10);
        assert!(report.errors.is_empty());
        assert!(report.invalid_actions.is_empty());
    }

    #[test]
    fn rejections_are_recorded_not_dropped() {
        let table = TestTable::new(4, 42);
        let manager = manager(&table);
        let mut events = manager.subscribe();
        let actions = signed_draws(&table, 1, 2);

        manager.verify_and_log_action(&actions[0]).unwrap();
        let replay = manager.verify_and_log_action(&actions[0]).unwrap_err();
        assert!(replay.is_replay());

        let mut forged = actions[1].clone();
        forged.peer_id = table.peer_id(2);
        assert!(matches!(
            manager.verify_and_log_action(&forged),
            Err(VerifyError::BadSignature { .. })
        ));

        let mut stranger = actions[1].clone();
        stranger.peer_id = "stranger".into();
        assert!(matches!(
            manager.verify_and_log_action(&stranger),
            Err(VerifyError::UnregisteredPeer { .. })
        ));

        assert_eq!(manager.log_len(), 1);
        assert_eq!(manager.invalid_actions().len(), 3);
        assert!(!manager.is_action_valid(&actions[1].id));
        assert!(manager.verify_game_complete().valid);

        let mut accepted = 0;
        let mut rejected = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                VerificationEvent::ActionAccepted { .. } => accepted += 1,
                VerificationEvent::ActionRejected(_) => rejected += 1,
                _ => {}
            }
        }
        assert_eq!((accepted, rejected), (1, 3));
    }

    #[test]
    fn export_import_preserves_state_and_blocks_replays() {
        let table = TestTable::new(4, 43);
        let source = manager(&table);
        let actions = signed_draws(&table, 0, 3);
        source.verify_action_sequence(actions.iter());
        let mut bad = actions[0].clone();
        bad.id = "bad".into();
        let _ = source.verify_and_log_action(&bad);

        let export = source.export_verification_data();
        crate::test_utils::serde::assert_round_trip_json(&export);

        let target = VerificationManager::new("game-1", &table.config, table.clock.clone());
        target.import_verification_data(export).unwrap();
        assert_eq!(target.log_len(), 3);
        assert_eq!(target.log_head(), source.log_head());
        assert!(!target.is_action_valid("bad"));
        assert!(target.verify_and_log_action(&actions[1]).unwrap_err().is_replay());
        assert!(target.verify_game_complete().valid);
    }

    #[test]
    fn import_rejects_broken_chain_without_side_effects() {
        let table = TestTable::new(4, 44);
        let source = manager(&table);
        source.verify_action_sequence(signed_draws(&table, 0, 3).iter());
        let mut export = source.export_verification_data();
        export.logs.logs[0].previous_hash = "ff".into();

        let target = manager(&table);
        target.verify_action_sequence(signed_draws(&table, 1, 1).iter());
        assert!(target.import_verification_data(export).is_err());
        assert_eq!(target.log_len(), 1);
    }

    #[test]
    fn clear_state_resets_everything() {
        let table = TestTable::new(4, 45);
        let manager = manager(&table);
        let actions = signed_draws(&table, 0, 2);
        manager.verify_action_sequence(actions.iter());
        manager.clear_state();
        assert_eq!(manager.log_len(), 0);
        assert_eq!(manager.log_head(), "0");
        assert!(manager.peer_key(&table.peer_id(0)).is_none());
    }
}
