use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("failed to import {kind} key: {reason}")]
    KeyImport { kind: &'static str, reason: String },

    #[error("key agreement produced a non-contributory shared secret")]
    KeyAgreement,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("authentication failed while decrypting layer {layer}")]
    Authentication { layer: usize },

    #[error("layer count mismatch: tile has {expected} layers, got {actual} keys")]
    LayerCountMismatch { expected: usize, actual: usize },

    #[error("malformed {field}: {reason}")]
    Encoding { field: &'static str, reason: String },

    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("decrypted plaintext is not a tile: {0}")]
    MalformedPlaintext(String),

    #[error("signature verification failed")]
    Signature,
}

impl CryptoError {
    pub(crate) fn encoding(field: &'static str, err: impl Display) -> Self {
        Self::Encoding {
            field,
            reason: err.to_string(),
        }
    }

    pub(crate) fn key_import(kind: &'static str, err: impl Display) -> Self {
        Self::KeyImport {
            kind,
            reason: err.to_string(),
        }
    }
}
