use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::crypto_serde::{array_map, decode_b64, encode_b64};
use crate::keys::{PeerPublicKeys, SigningKeyPair, SigningPublicKey};
use crate::ledger::hash::hash_record;
use crate::ledger::types::{GameId, PeerId};
use crate::ledger::{ActionLogExport, InvalidActionRecord};
use crate::proofs::ProofExport;
use crate::signing::canonical_json;
use crate::tiles::Tile;

/// Everything the pipeline needs besides the deck and the disclosed keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationData {
    pub logs: ActionLogExport,
    /// Key announcements in seat order.
    pub players: Vec<PeerPublicKeys>,
    #[serde(with = "array_map", default)]
    pub proofs: BTreeMap<PeerId, ProofExport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndCondition {
    Win,
    Exhaustive,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalGameState {
    pub game_id: GameId,
    /// Seat order; seat 0 is the dealer.
    pub players: Vec<PeerId>,
    #[serde(with = "array_map")]
    pub final_scores: BTreeMap<PeerId, i64>,
    #[serde(default)]
    pub winner: Option<PeerId>,
    pub end_condition: EndCondition,
}

/// Concealed tiles of one peer after each of its hand-changing actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandHistory {
    pub snapshots: Vec<Vec<Tile>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub game_id: GameId,
    pub timestamp: Timestamp,
    pub deck_valid: bool,
    pub actions_valid: bool,
    pub final_state_valid: bool,
    pub invalid_action_count: usize,
}

/// The summary, its digest, and the verifying peer's signature over the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationProof {
    pub summary: VerificationSummary,
    pub digest: String,
    pub signature: String,
    pub signer: SigningPublicKey,
}

impl VerificationProof {
    fn digest_of(summary: &VerificationSummary) -> [u8; 32] {
        let canonical = serde_json::to_value(summary)
            .map(|value| canonical_json(&value))
            .unwrap_or_default();
        hash_record("verification_summary", canonical.as_bytes()).into_bytes()
    }

    pub fn sign(summary: VerificationSummary, key: &SigningKeyPair) -> Self {
        let digest = Self::digest_of(&summary);
        Self {
            summary,
            digest: encode_b64(digest),
            signature: encode_b64(key.sign(&digest)),
            signer: key.public_key(),
        }
    }

    pub fn verify(&self) -> bool {
        let digest = Self::digest_of(&self.summary);
        let claimed = match decode_b64("digest", &self.digest) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        claimed.as_slice() == digest.as_slice()
            && self.signer.verify_base64(&digest, &self.signature).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub success: bool,
    pub initial_deck_valid: bool,
    pub actions_valid: bool,
    pub proofs_valid: bool,
    pub final_state_valid: bool,
    pub invalid_actions: Vec<InvalidActionRecord>,
    /// Deck-, proof- and state-level findings not tied to a single action.
    pub errors: Vec<String>,
    #[serde(with = "array_map")]
    pub player_hand_histories: BTreeMap<PeerId, HandHistory>,
    pub full_deck_decrypted: Vec<Tile>,
    pub verification_proof: VerificationProof,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostGameExport {
    pub game_id: GameId,
    pub timestamp: Timestamp,
    pub verification_result: VerificationResult,
    pub verification_data: VerificationData,
    pub game_state: FinalGameState,
}
