//! Signed decryption commitments.
//!
//! A proof binds a tile position, the layered tile a peer received, what it
//! produced after removing its own layer, and a hash of the key it used. It is
//! a signed commitment, not a zero-knowledge proof: it becomes checkable
//! against the real key once that key is disclosed after the game.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{SharedClock, Timestamp};
use crate::crypto_serde::{array_map, decode_b64, encode_b64};
use crate::encryption::{peel_layer, CryptoError, EncryptedTile, PeeledTile};
use crate::keys::{EncryptionSecretKey, SigningKeyPair, SigningPublicKey};
use crate::ledger::hash::hash_record;
use crate::ledger::types::PeerId;
use crate::signing::TranscriptBuilder;

const LOG_TARGET: &str = "legit_mahjong::proofs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionProof {
    pub tile_index: u32,
    pub peer_id: PeerId,
    pub encrypted_tile: EncryptedTile,
    pub decrypted_tile: PeeledTile,
    /// Hex hash of the decryption key; never the key itself.
    pub key_hash: String,
    /// Base64 digest over every field above plus the timestamp.
    pub proof: String,
    pub timestamp: Timestamp,
    pub signature: String,
}

impl DecryptionProof {
    fn digest(&self) -> [u8; 32] {
        let mut builder = TranscriptBuilder::new("decryption_proof_v1");
        builder.append_u64(self.tile_index as u64);
        builder.append_str(&self.peer_id);
        builder.append_json(&serde_json::to_value(&self.encrypted_tile).unwrap_or_default());
        builder.append_json(&serde_json::to_value(&self.decrypted_tile).unwrap_or_default());
        builder.append_str(&self.key_hash);
        builder.append_i64(self.timestamp);
        hash_record("decryption_proof", &builder.finish()).into_bytes()
    }

    /// Recomputes the digest and checks the signature over it.
    pub fn check(&self, key: &SigningPublicKey) -> Result<(), ProofFailureKind> {
        let claimed = decode_b64("proof", &self.proof).map_err(|_| ProofFailureKind::Malformed)?;
        if claimed.as_slice() != self.digest().as_slice() {
            return Err(ProofFailureKind::DigestMismatch);
        }
        let signature =
            decode_b64("signature", &self.signature).map_err(|_| ProofFailureKind::Malformed)?;
        key.verify(&claimed, &signature)
            .map_err(|_| ProofFailureKind::BadSignature)
    }
}

/// Hex fingerprint of a decryption key as committed in proofs.
pub fn key_fingerprint(secret: &EncryptionSecretKey) -> String {
    hash_record("decryption_key", secret.as_bytes()).to_hex()
}

/// Whether `secret` is the key the proof committed to.
pub fn key_matches(proof: &DecryptionProof, secret: &EncryptionSecretKey) -> bool {
    proof.key_hash == key_fingerprint(secret)
}

pub fn verify_proof(proof: &DecryptionProof, key: &SigningPublicKey) -> bool {
    proof.check(key).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProofFailureKind {
    MissingKey,
    Malformed,
    DigestMismatch,
    BadSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofFailure {
    pub tile_index: u32,
    pub kind: ProofFailureKind,
}

impl fmt::Display for ProofFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ProofFailureKind::MissingKey => write!(f, "No public key for tile {}", self.tile_index),
            _ => write!(f, "Invalid proof for tile {} ({:?})", self.tile_index, self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofExport {
    #[serde(with = "array_map")]
    pub proofs: BTreeMap<u32, DecryptionProof>,
    pub timestamp: Timestamp,
}

impl ProofExport {
    /// Per-tile results; an empty list means every proof checked out.
    pub fn verify_all(&self, keys: &BTreeMap<u32, SigningPublicKey>) -> Vec<ProofFailure> {
        verify_map(&self.proofs, keys)
    }
}

fn verify_map(
    proofs: &BTreeMap<u32, DecryptionProof>,
    keys: &BTreeMap<u32, SigningPublicKey>,
) -> Vec<ProofFailure> {
    proofs
        .iter()
        .filter_map(|(tile_index, proof)| {
            let kind = match keys.get(tile_index) {
                None => Some(ProofFailureKind::MissingKey),
                Some(key) => proof.check(key).err(),
            };
            kind.map(|kind| ProofFailure {
                tile_index: *tile_index,
                kind,
            })
        })
        .collect()
}

/// One peer's store of proofs, at most one per tile position.
pub struct DecryptionProofService {
    peer_id: PeerId,
    signer: SigningKeyPair,
    clock: SharedClock,
    proofs: RwLock<BTreeMap<u32, DecryptionProof>>,
}

impl DecryptionProofService {
    pub fn new(peer_id: impl Into<PeerId>, signer: SigningKeyPair, clock: SharedClock) -> Self {
        Self {
            peer_id: peer_id.into(),
            signer,
            clock,
            proofs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Commits to a decryption and stores the proof, replacing any earlier one
    /// for the same tile.
    pub fn generate_proof(
        &self,
        tile_index: u32,
        encrypted_tile: EncryptedTile,
        decrypted_tile: PeeledTile,
        secret: &EncryptionSecretKey,
    ) -> DecryptionProof {
        let mut proof = DecryptionProof {
            tile_index,
            peer_id: self.peer_id.clone(),
            encrypted_tile,
            decrypted_tile,
            key_hash: key_fingerprint(secret),
            proof: String::new(),
            timestamp: self.clock.now_millis(),
            signature: String::new(),
        };
        let digest = proof.digest();
        proof.proof = encode_b64(digest);
        proof.signature = encode_b64(self.signer.sign(&digest));
        debug!(target: LOG_TARGET, peer_id = %self.peer_id, tile_index, "generated decryption proof");
        self.proofs.write().insert(tile_index, proof.clone());
        proof
    }

    /// Removes this peer's layer from `tile` and proves it.
    pub fn peel_and_prove(
        &self,
        tile_index: u32,
        tile: &EncryptedTile,
        secret: &EncryptionSecretKey,
    ) -> Result<(PeeledTile, DecryptionProof), CryptoError> {
        let peeled = peel_layer(tile, secret)?;
        let proof = self.generate_proof(tile_index, tile.clone(), peeled.clone(), secret);
        Ok((peeled, proof))
    }

    pub fn proof(&self, tile_index: u32) -> Option<DecryptionProof> {
        self.proofs.read().get(&tile_index).cloned()
    }

    pub fn proofs(&self) -> Vec<DecryptionProof> {
        self.proofs.read().values().cloned().collect()
    }

    pub fn verify_all_proofs(&self, keys: &BTreeMap<u32, SigningPublicKey>) -> Vec<ProofFailure> {
        let failures = verify_map(&self.proofs.read(), keys);
        for failure in &failures {
            warn!(
                target: LOG_TARGET,
                tile_index = failure.tile_index,
                kind = ?failure.kind,
                "decryption proof failed"
            );
        }
        failures
    }

    pub fn export_proofs(&self) -> ProofExport {
        ProofExport {
            proofs: self.proofs.read().clone(),
            timestamp: self.clock.now_millis(),
        }
    }

    pub fn import_proofs(&self, export: ProofExport) {
        *self.proofs.write() = export.proofs;
    }

    pub fn clear(&self) {
        self.proofs.write().clear();
    }
}
