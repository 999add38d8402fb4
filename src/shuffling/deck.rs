use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::encryption::{CryptoError, EncryptedTile};
use crate::keys::{SigningKeyPair, SigningPublicKey};
use crate::ledger::types::PeerId;
use crate::signing::{Signable, TranscriptBuilder};

/// One peer's signed shuffle pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShuffleRecord {
    pub peer_id: PeerId,
    pub timestamp: Timestamp,
    /// `shuffle_indices[i]` is the source position of output position `i`.
    pub shuffle_indices: Vec<u32>,
    pub signature: String,
}

impl Signable for ShuffleRecord {
    fn domain_kind(&self) -> &'static str {
        "shuffle_record_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        builder.append_str(&self.peer_id);
        builder.append_i64(self.timestamp);
        builder.append_u64(self.shuffle_indices.len() as u64);
        for index in &self.shuffle_indices {
            builder.append_u64(u64::from(*index));
        }
    }
}

impl ShuffleRecord {
    pub fn signed(
        peer_id: impl Into<PeerId>,
        timestamp: Timestamp,
        shuffle_indices: Vec<u32>,
        key: &SigningKeyPair,
    ) -> Self {
        let mut record = Self {
            peer_id: peer_id.into(),
            timestamp,
            shuffle_indices,
            signature: String::new(),
        };
        record.signature = record.sign_with(key);
        record
    }

    pub fn verify(&self, key: &SigningPublicKey) -> Result<(), CryptoError> {
        self.verify_with(key, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedDeck {
    pub tiles: Vec<EncryptedTile>,
    pub shuffle_history: Vec<ShuffleRecord>,
    pub encryption_order: Vec<PeerId>,
}

impl EncryptedDeck {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn rounds(&self) -> usize {
        self.shuffle_history.len()
    }

    pub fn tile(&self, index: usize) -> Option<&EncryptedTile> {
        self.tiles.get(index)
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.shuffle_history.last().map(|record| record.timestamp)
    }

    pub(crate) fn has_unique_ids(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.tiles.len());
        self.tiles.iter().all(|tile| seen.insert(tile.id.as_str()))
    }

    /// History and encryption order name the same peers in the same order.
    pub(crate) fn order_matches_history(&self) -> bool {
        self.encryption_order.len() == self.shuffle_history.len()
            && self
                .encryption_order
                .iter()
                .zip(&self.shuffle_history)
                .all(|(peer, record)| *peer == record.peer_id)
    }
}
