use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::encryption::CryptoError;

/// Encodes bytes as standard padded base64.
pub fn encode_b64(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decodes standard padded base64, naming the field on failure.
pub fn decode_b64(field: &'static str, value: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(value.trim())
        .map_err(|err| CryptoError::encoding(field, err))
}

pub fn encode_b64url(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode_b64url(field: &'static str, value: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(value.trim())
        .map_err(|err| CryptoError::encoding(field, err))
}

/// Decodes base64 into a fixed-size array.
pub fn decode_b64_array<const N: usize>(
    field: &'static str,
    value: &str,
) -> Result<[u8; N], CryptoError> {
    let bytes = decode_b64(field, value)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidLength {
        field,
        expected: N,
        actual: bytes.len(),
    })
}

/// Serde helpers for `Vec<u8>` fields encoded as base64 strings.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S>(value: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&encode_b64(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.trim()).map_err(DeError::custom)
    }
}

/// Serde helpers for maps serialized as sorted arrays of `[key, value]` pairs.
pub mod array_map {
    use super::*;
    use std::collections::BTreeMap;

    pub fn serialize<K, V, S>(
        value: &BTreeMap<K, V>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        K: Serialize + Clone + Ord,
        V: Serialize,
        S: Serializer,
    {
        let entries: Vec<(K, &V)> = value.iter().map(|(key, v)| (key.clone(), v)).collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, K, V, D>(
        deserializer: D,
    ) -> std::result::Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let entries = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}
