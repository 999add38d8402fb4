use serde_json::Value;

use crate::crypto_serde::encode_b64;
use crate::encryption::CryptoError;
use crate::keys::{SigningKeyPair, SigningPublicKey};

const DOMAIN_TAG: &[u8] = b"legit-mahjong/v1";

/// Builder for canonical signing transcripts.
pub struct TranscriptBuilder {
    buffer: Vec<u8>,
}

impl TranscriptBuilder {
    pub fn new(kind: &'static str) -> Self {
        let mut buffer = Vec::with_capacity(128);
        buffer.extend_from_slice(DOMAIN_TAG);
        buffer.extend_from_slice(&(kind.len() as u16).to_be_bytes());
        buffer.extend_from_slice(kind.as_bytes());
        Self { buffer }
    }

    pub fn append_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn append_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buffer
            .extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buffer.extend_from_slice(bytes);
    }

    pub fn append_str(&mut self, value: &str) {
        self.append_bytes(value.as_bytes());
    }

    /// Appends a JSON value in canonical form (sorted object keys, no whitespace).
    pub fn append_json(&mut self, value: &Value) {
        self.append_str(&canonical_json(value));
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Values that can be signed into a canonical transcript.
pub trait Signable {
    /// Logical kind string used for domain separation.
    fn domain_kind(&self) -> &'static str;

    /// Append this value's canonical representation into the transcript builder.
    fn write_transcript(&self, builder: &mut TranscriptBuilder);

    /// Obtain canonical signing bytes.
    fn to_signing_bytes(&self) -> Vec<u8> {
        let mut builder = TranscriptBuilder::new(self.domain_kind());
        self.write_transcript(&mut builder);
        builder.finish()
    }

    /// Signs the transcript and returns the base64 signature.
    fn sign_with(&self, key: &SigningKeyPair) -> String {
        encode_b64(key.sign(&self.to_signing_bytes()))
    }

    /// Checks a base64 signature over the transcript.
    fn verify_with(&self, key: &SigningPublicKey, signature: &str) -> Result<(), CryptoError> {
        key.verify_base64(&self.to_signing_bytes(), signature)
    }
}

/// Serializes `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = json!({ "b": 1, "a": { "z": [ { "y": 2, "x": 1 } ], "c": "s" } });
        let b: Value =
            serde_json::from_str(r#"{"a":{"c":"s","z":[{"x":1,"y":2}]},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"c":"s","z":[{"x":1,"y":2}]},"b":1}"#);
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn transcripts_are_length_prefixed() {
        let mut left = TranscriptBuilder::new("test");
        left.append_str("ab");
        left.append_str("c");
        let mut right = TranscriptBuilder::new("test");
        right.append_str("a");
        right.append_str("bc");
        assert_ne!(left.finish(), right.finish());
    }

    struct Seat<'a> {
        peer_id: &'a str,
        points: i64,
    }

    impl Signable for Seat<'_> {
        fn domain_kind(&self) -> &'static str {
            "test/seat_v1"
        }

        fn write_transcript(&self, builder: &mut TranscriptBuilder) {
            builder.append_str(self.peer_id);
            builder.append_i64(self.points);
        }
    }

    #[test]
    fn signable_values_sign_and_verify() {
        let mut rng = StdRng::seed_from_u64(21);
        let key = SigningKeyPair::generate(&mut rng);
        let seat = Seat {
            peer_id: "north",
            points: 25_000,
        };

        let signature = seat.sign_with(&key);
        seat.verify_with(&key.public_key(), &signature).unwrap();

        let raised = Seat {
            points: 31_000,
            ..seat
        };
        assert!(raised.verify_with(&key.public_key(), &signature).is_err());

        let other = SigningKeyPair::generate(&mut rng);
        assert!(seat.verify_with(&other.public_key(), &signature).is_err());
    }
}
