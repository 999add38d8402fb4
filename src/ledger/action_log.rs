use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Timestamp;
use crate::game::GameAction;
use crate::keys::SigningPublicKey;
use crate::ledger::error::{BreakReason, ChainError};
use crate::ledger::hash::hash_log_entry;
use crate::ledger::types::{ActionId, GENESIS_HASH};

const LOG_TARGET: &str = "legit_mahjong::ledger::action_log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub id: ActionId,
    /// The action as signed, serialized to JSON.
    pub action: String,
    pub signature: String,
    pub public_key: SigningPublicKey,
    pub timestamp: Timestamp,
    pub previous_hash: String,
}

impl ActionLogEntry {
    pub fn decode_action(&self) -> Result<GameAction, serde_json::Error> {
        serde_json::from_str(&self.action)
    }

    pub fn hash(&self) -> String {
        hash_log_entry(self).to_hex()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBreak {
    pub index: usize,
    pub reason: BreakReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub valid: bool,
    pub breaks: Vec<ChainBreak>,
}

impl ChainReport {
    pub fn first_break(&self) -> Option<ChainBreak> {
        self.breaks.first().copied()
    }

    /// `Log i: reason` lines for reports.
    pub fn messages(&self) -> Vec<String> {
        self.breaks
            .iter()
            .map(|b| format!("Log {}: {}", b.index, b.reason))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogExport {
    pub logs: Vec<ActionLogEntry>,
    pub last_hash: String,
    pub timestamp: Timestamp,
}

/// Append-only, hash-chained record of accepted actions.
#[derive(Debug, Clone)]
pub struct ActionLog {
    entries: Vec<ActionLogEntry>,
    head: String,
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            head: GENESIS_HASH.to_string(),
        }
    }

    /// Appends an already signed action and advances the chain head.
    pub fn append(
        &mut self,
        action: &GameAction,
        public_key: SigningPublicKey,
    ) -> Result<&ActionLogEntry, ChainError> {
        let Some(signature) = action.signature.clone() else {
            return Err(ChainError::UnsignedAction {
                action_id: action.id.clone(),
            });
        };
        let serialized =
            serde_json::to_string(action).map_err(|err| ChainError::Serialization(err.to_string()))?;
        let entry = ActionLogEntry {
            id: action.id.clone(),
            action: serialized,
            signature,
            public_key,
            timestamp: action.timestamp,
            previous_hash: self.head.clone(),
        };
        self.head = entry.hash();
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Walks the chain from genesis. Every entry at or after the first break is
    /// reported: with its own failure if it has one, otherwise as following the break.
    pub fn verify_chain(&self) -> ChainReport {
        let mut breaks = Vec::new();
        let mut expected_previous = GENESIS_HASH.to_string();
        for (index, entry) in self.entries.iter().enumerate() {
            let own = entry_failure(entry, &expected_previous);
            match own {
                Some(reason) => breaks.push(ChainBreak { index, reason }),
                None if !breaks.is_empty() => breaks.push(ChainBreak {
                    index,
                    reason: BreakReason::FollowsBreak,
                }),
                None => {}
            }
            expected_previous = entry.hash();
        }
        if let Some(first) = breaks.first() {
            warn!(
                target: LOG_TARGET,
                index = first.index,
                reason = %first.reason,
                flagged = breaks.len(),
                "action log chain broken"
            );
        }
        ChainReport {
            valid: breaks.is_empty(),
            breaks,
        }
    }

    pub fn entries(&self) -> &[ActionLogEntry] {
        &self.entries
    }

    pub fn entries_by_public_key(&self, key: &SigningPublicKey) -> Vec<&ActionLogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.public_key == *key)
            .collect()
    }

    pub fn entries_since(&self, timestamp: Timestamp) -> Vec<&ActionLogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.timestamp >= timestamp)
            .collect()
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.head = GENESIS_HASH.to_string();
    }

    pub fn export(&self, now: Timestamp) -> ActionLogExport {
        ActionLogExport {
            logs: self.entries.clone(),
            last_hash: self.head.clone(),
            timestamp: now,
        }
    }

    /// Rebuilds a log from an export. Fails unless the whole chain verifies and
    /// the claimed head matches.
    pub fn import(export: ActionLogExport) -> Result<Self, ChainError> {
        let head = export
            .logs
            .last()
            .map(ActionLogEntry::hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let log = Self {
            entries: export.logs,
            head,
        };
        let report = log.verify_chain();
        if let Some(first) = report.first_break() {
            return Err(ChainError::Broken {
                index: first.index,
                reason: first.reason,
            });
        }
        if log.head != export.last_hash {
            return Err(ChainError::HeadMismatch {
                claimed: export.last_hash,
                actual: log.head,
            });
        }
        info!(target: LOG_TARGET, entries = log.len(), head = %log.head, "imported action log");
        Ok(log)
    }

    #[cfg(test)]
    pub(crate) fn entries_mut(&mut self) -> &mut Vec<ActionLogEntry> {
        &mut self.entries
    }
}

fn entry_failure(entry: &ActionLogEntry, expected_previous: &str) -> Option<BreakReason> {
    if entry.previous_hash != expected_previous {
        return Some(BreakReason::PreviousHashMismatch);
    }
    let Ok(action) = entry.decode_action() else {
        return Some(BreakReason::MalformedEntry);
    };
    if action.id != entry.id
        || action.timestamp != entry.timestamp
        || action.signature.as_deref() != Some(entry.signature.as_str())
    {
        return Some(BreakReason::MalformedEntry);
    }
    if action.verify_signature(&entry.public_key).is_err() {
        return Some(BreakReason::InvalidSignature);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{signed_draws, TestTable};

    #[test]
    fn empty_log_starts_at_genesis() {
        let log = ActionLog::new();
        assert_eq!(log.head(), "0");
        assert!(log.verify_chain().valid);
    }

    #[test]
    fn append_links_entries() {
        let table = TestTable::new(4, 31);
        let mut log = ActionLog::new();
        let actions = signed_draws(&table, 0, 3);
        for action in &actions {
            log.append(action, table.signing_public(0)).unwrap();
        }
        assert_eq!(log.entries()[0].previous_hash, "0");
        assert_eq!(log.entries()[1].previous_hash, log.entries()[0].hash());
        assert_eq!(log.head(), log.entries()[2].hash());
        assert!(log.verify_chain().valid);
    }

    #[test]
    fn unsigned_actions_are_refused() {
        let table = TestTable::new(4, 32);
        let mut action = signed_draws(&table, 0, 1).remove(0);
        action.signature = None;
        let mut log = ActionLog::new();
        assert!(matches!(
            log.append(&action, table.signing_public(0)),
            Err(ChainError::UnsignedAction { .. })
        ));
        assert!(log.is_empty());
    }

    #[test]
    fn corrupted_previous_hash_flags_entry_and_all_following() {
        let table = TestTable::new(4, 33);
        let mut log = ActionLog::new();
        for action in signed_draws(&table, 0, 6) {
            log.append(&action, table.signing_public(0)).unwrap();
        }
        log.entries_mut()[2].previous_hash = "deadbeef".into();

        let report = log.verify_chain();
        assert!(!report.valid);
        assert_eq!(
            report.first_break(),
            Some(ChainBreak {
                index: 2,
                reason: BreakReason::PreviousHashMismatch
            })
        );
        let flagged: Vec<usize> = report.breaks.iter().map(|b| b.index).collect();
        assert_eq!(flagged, vec![2, 3, 4, 5]);
        assert_eq!(report.messages()[0], "Log 2: Previous hash mismatch");
    }

    #[test]
    fn wrong_public_key_is_an_invalid_signature() {
        let table = TestTable::new(4, 34);
        let mut log = ActionLog::new();
        for action in signed_draws(&table, 0, 2) {
            log.append(&action, table.signing_public(1)).unwrap();
        }
        let report = log.verify_chain();
        assert_eq!(report.breaks[0].reason, BreakReason::InvalidSignature);
        assert_eq!(report.breaks.len(), 2);
    }

    #[test]
    fn export_import_round_trip_and_rejections() {
        let table = TestTable::new(4, 35);
        let mut log = ActionLog::new();
        for action in signed_draws(&table, 0, 4) {
            log.append(&action, table.signing_public(0)).unwrap();
        }
        let export = log.export(99);
        let json = serde_json::to_value(&export).unwrap();
        assert!(json["lastHash"].is_string());
        assert!(json["logs"][0]["previousHash"].is_string());

        let restored = ActionLog::import(export.clone()).unwrap();
        assert_eq!(restored.head(), log.head());
        assert_eq!(restored.entries(), log.entries());

        let mut wrong_head = export.clone();
        wrong_head.last_hash = "0".into();
        assert!(matches!(
            ActionLog::import(wrong_head),
            Err(ChainError::HeadMismatch { .. })
        ));

        let mut tampered = export;
        tampered.logs[1].timestamp += 1;
        assert!(matches!(
            ActionLog::import(tampered),
            Err(ChainError::Broken {
                index: 1,
                reason: BreakReason::MalformedEntry
            })
        ));
    }

    #[test]
    fn entry_time_must_match_the_signed_action() {
        let table = TestTable::new(4, 37);
        let mut log = ActionLog::new();
        for action in signed_draws(&table, 0, 3) {
            log.append(&action, table.signing_public(0)).unwrap();
        }
        let mut export = log.export(99);
        // Shift the newest entry and re-seal the head so only the binding catches it.
        let last = export.logs.len() - 1;
        export.logs[last].timestamp += 999_999;
        export.last_hash = export.logs[last].hash();
        assert_eq!(
            ActionLog::import(export).unwrap_err(),
            ChainError::Broken {
                index: last,
                reason: BreakReason::MalformedEntry,
            }
        );
    }

    #[test]
    fn queries_filter_entries() {
        let table = TestTable::new(4, 36);
        let mut log = ActionLog::new();
        for action in signed_draws(&table, 0, 2) {
            log.append(&action, table.signing_public(0)).unwrap();
        }
        for action in signed_draws(&table, 1, 1) {
            log.append(&action, table.signing_public(1)).unwrap();
        }
        assert_eq!(log.entries_by_public_key(&table.signing_public(1)).len(), 1);
        let last_ts = log.entries()[2].timestamp;
        assert_eq!(log.entries_since(last_ts).len(), 1);
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.head(), "0");
    }
}
