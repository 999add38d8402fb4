use sha2::{Digest, Sha256};

use crate::ledger::action_log::ActionLogEntry;
use crate::ledger::types::StateHash;

const DOMAIN_ENTRY: &[u8] = b"legit-mahjong/log/entry/v1";
const DOMAIN_RECORD: &[u8] = b"legit-mahjong/record/v1";

fn finalize_hash(hasher: Sha256) -> StateHash {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    StateHash::from(bytes)
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_be_bytes());
}

fn write_i64(hasher: &mut Sha256, value: i64) {
    hasher.update(value.to_be_bytes());
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    write_len(hasher, bytes.len());
    hasher.update(bytes);
}

fn write_str(hasher: &mut Sha256, value: &str) {
    write_bytes(hasher, value.as_bytes());
}

/// Hash of a log entry; the next entry's `previous_hash` must equal its hex form.
pub fn hash_log_entry(entry: &ActionLogEntry) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_ENTRY);
    write_str(&mut hasher, &entry.id);
    write_str(&mut hasher, &entry.action);
    write_str(&mut hasher, &entry.signature);
    write_str(&mut hasher, &entry.public_key.to_base64());
    write_i64(&mut hasher, entry.timestamp);
    write_str(&mut hasher, &entry.previous_hash);
    finalize_hash(hasher)
}

/// Domain-separated digest of an already canonical record.
pub fn hash_record(kind: &str, canonical: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_RECORD);
    write_str(&mut hasher, kind);
    write_bytes(&mut hasher, canonical);
    finalize_hash(hasher)
}
