use std::fmt;
use std::hash::{Hash, Hasher};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto_serde::{decode_b64_array, decode_b64url, encode_b64, encode_b64url};
use crate::encryption::CryptoError;
use crate::ledger::types::PeerId;

const FINGERPRINT_BYTES: usize = 8;

/// Exported form shared by both key flavours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedKeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// Long-lived Ed25519 key used to authenticate actions, shuffle records and proofs.
#[derive(Clone)]
pub struct SigningKeyPair {
    inner: SigningKey,
}

impl SigningKeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: SigningKey::generate(rng),
        }
    }

    pub fn public_key(&self) -> SigningPublicKey {
        SigningPublicKey(self.inner.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.inner.sign(message).to_bytes()
    }

    pub fn export(&self) -> ExportedKeyPair {
        ExportedKeyPair {
            public_key: self.public_key().to_base64(),
            private_key: encode_b64(self.inner.to_bytes()),
        }
    }

    pub fn import(exported: &ExportedKeyPair) -> Result<Self, CryptoError> {
        let mut secret = decode_b64_array::<32>("signing private key", &exported.private_key)?;
        let inner = SigningKey::from_bytes(&secret);
        secret.zeroize();
        let public = SigningPublicKey::from_base64(&exported.public_key)?;
        if public.as_bytes() != inner.verifying_key().as_bytes() {
            return Err(CryptoError::key_import(
                "signing",
                "public key does not match private key",
            ));
        }
        Ok(Self { inner })
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
pub struct SigningPublicKey(VerifyingKey);

impl SigningPublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|err| CryptoError::key_import("signing public", err))
    }

    pub fn from_base64(value: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&decode_b64_array::<32>("signing public key", value)?)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_base64(&self) -> String {
        encode_b64(self.0.as_bytes())
    }

    /// Short hex identifier for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..FINGERPRINT_BYTES])
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let bytes = <[u8; 64]>::try_from(signature).map_err(|_| CryptoError::InvalidLength {
            field: "signature",
            expected: 64,
            actual: signature.len(),
        })?;
        self.0
            .verify_strict(message, &Signature::from_bytes(&bytes))
            .map_err(|_| CryptoError::Signature)
    }

    pub fn verify_base64(&self, message: &[u8], signature: &str) -> Result<(), CryptoError> {
        let bytes = decode_b64_array::<64>("signature", signature)?;
        self.verify(message, &bytes)
    }
}

impl PartialEq for SigningPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for SigningPublicKey {}

impl Hash for SigningPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey({})", self.fingerprint())
    }
}

impl Serialize for SigningPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_base64(&value).map_err(serde::de::Error::custom)
    }
}

/// X25519 public key, exchanged as a JWK-like `{kty, crv, x}` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Jwk", into = "Jwk")]
pub struct EncryptionPublicKey([u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
}

const JWK_KTY: &str = "OKP";
const JWK_CRV: &str = "X25519";

impl EncryptionPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            kty: JWK_KTY.to_string(),
            crv: JWK_CRV.to_string(),
            x: encode_b64url(self.0),
        }
    }

    pub(crate) fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl TryFrom<Jwk> for EncryptionPublicKey {
    type Error = CryptoError;

    fn try_from(jwk: Jwk) -> Result<Self, Self::Error> {
        if jwk.kty != JWK_KTY || jwk.crv != JWK_CRV {
            return Err(CryptoError::key_import(
                "encryption public",
                format!("unsupported key type {}/{}", jwk.kty, jwk.crv),
            ));
        }
        let bytes = decode_b64url("jwk x", &jwk.x)?;
        let bytes = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
            CryptoError::InvalidLength {
                field: "jwk x",
                expected: 32,
                actual: bytes.len(),
            }
        })?;
        Ok(Self(bytes))
    }
}

impl From<EncryptionPublicKey> for Jwk {
    fn from(key: EncryptionPublicKey) -> Self {
        key.to_jwk()
    }
}

/// X25519 secret. Leaves its owner only through post-game disclosure.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionSecretKey([u8; 32]);

impl EncryptionSecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(value: &str) -> Result<Self, CryptoError> {
        decode_b64_array::<32>("encryption private key", value).map(Self)
    }

    pub fn to_base64(&self) -> String {
        encode_b64(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn public_key(&self) -> EncryptionPublicKey {
        EncryptionPublicKey(PublicKey::from(&self.to_dalek()).to_bytes())
    }

    pub fn matches(&self, public: &EncryptionPublicKey) -> bool {
        self.public_key() == *public
    }

    pub(crate) fn to_dalek(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

impl PartialEq for EncryptionSecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for EncryptionSecretKey {}

impl fmt::Debug for EncryptionSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionSecretKey(..)")
    }
}

impl Serialize for EncryptionSecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for EncryptionSecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_base64(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug)]
pub struct EncryptionKeyPair {
    public: EncryptionPublicKey,
    secret: EncryptionSecretKey,
}

impl EncryptionKeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self {
            public: EncryptionPublicKey(public.to_bytes()),
            secret: EncryptionSecretKey(secret.to_bytes()),
        }
    }

    pub fn public_key(&self) -> EncryptionPublicKey {
        self.public
    }

    pub fn secret(&self) -> &EncryptionSecretKey {
        &self.secret
    }

    pub fn export(&self) -> ExportedKeyPair {
        ExportedKeyPair {
            public_key: encode_b64(self.public.0),
            private_key: self.secret.to_base64(),
        }
    }

    pub fn import(exported: &ExportedKeyPair) -> Result<Self, CryptoError> {
        let secret = EncryptionSecretKey::from_base64(&exported.private_key)?;
        let public = EncryptionPublicKey(decode_b64_array::<32>(
            "encryption public key",
            &exported.public_key,
        )?);
        if !secret.matches(&public) {
            return Err(CryptoError::key_import(
                "encryption",
                "public key does not match private key",
            ));
        }
        Ok(Self { public, secret })
    }
}

/// Everything one peer holds: a signing pair and an encryption pair.
#[derive(Clone, Debug)]
pub struct PeerKeys {
    pub peer_id: PeerId,
    pub signing: SigningKeyPair,
    pub encryption: EncryptionKeyPair,
}

impl PeerKeys {
    pub fn generate<R: RngCore + CryptoRng>(peer_id: impl Into<PeerId>, rng: &mut R) -> Self {
        Self {
            peer_id: peer_id.into(),
            signing: SigningKeyPair::generate(rng),
            encryption: EncryptionKeyPair::generate(rng),
        }
    }

    pub fn public(&self) -> PeerPublicKeys {
        PeerPublicKeys {
            peer_id: self.peer_id.clone(),
            signing_key: self.signing.public_key(),
            encryption_key: self.encryption.public_key(),
        }
    }
}

/// Announcement a peer broadcasts at table setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPublicKeys {
    pub peer_id: PeerId,
    pub signing_key: SigningPublicKey,
    pub encryption_key: EncryptionPublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::serde::{assert_round_trip_eq, assert_round_trip_json};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn signing_pair_signs_and_verifies() {
        let mut rng = StdRng::seed_from_u64(7);
        let pair = SigningKeyPair::generate(&mut rng);
        let signature = pair.sign(b"discard 5p");
        let public = pair.public_key();
        public.verify(b"discard 5p", &signature).unwrap();
        assert_eq!(
            public.verify(b"discard 6p", &signature),
            Err(CryptoError::Signature)
        );
        assert!(matches!(
            public.verify(b"discard 5p", &signature[..10]),
            Err(CryptoError::InvalidLength { .. })
        ));
    }

    #[test]
    fn signing_pair_export_round_trips() {
        let mut rng = StdRng::seed_from_u64(8);
        let pair = SigningKeyPair::generate(&mut rng);
        let restored = SigningKeyPair::import(&pair.export()).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
    }

    #[test]
    fn signing_import_rejects_mismatched_halves() {
        let mut rng = StdRng::seed_from_u64(9);
        let a = SigningKeyPair::generate(&mut rng).export();
        let b = SigningKeyPair::generate(&mut rng).export();
        let mixed = ExportedKeyPair {
            public_key: a.public_key,
            private_key: b.private_key,
        };
        assert!(matches!(
            SigningKeyPair::import(&mixed),
            Err(CryptoError::KeyImport { .. })
        ));
    }

    #[test]
    fn encryption_pair_export_round_trips() {
        let mut rng = StdRng::seed_from_u64(10);
        let pair = EncryptionKeyPair::generate(&mut rng);
        let restored = EncryptionKeyPair::import(&pair.export()).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
        assert!(restored.secret().matches(&pair.public_key()));
    }

    #[test]
    fn encryption_public_key_is_jwk() {
        let mut rng = StdRng::seed_from_u64(11);
        let public = EncryptionKeyPair::generate(&mut rng).public_key();
        let json = serde_json::to_value(public).unwrap();
        assert_eq!(json["kty"], "OKP");
        assert_eq!(json["crv"], "X25519");
        assert_eq!(json["x"].as_str().unwrap().len(), 43);
        assert_round_trip_eq(&public);

        let bad = serde_json::json!({ "kty": "EC", "crv": "P-256", "x": json["x"] });
        assert!(serde_json::from_value::<EncryptionPublicKey>(bad).is_err());
    }

    #[test]
    fn peer_announcement_round_trips() {
        let mut rng = StdRng::seed_from_u64(12);
        let keys = PeerKeys::generate("east", &mut rng);
        let announcement = keys.public();
        assert_eq!(announcement.peer_id, "east");
        assert_round_trip_eq(&announcement);
        assert_round_trip_json(&announcement);
    }

    #[test]
    fn secret_debug_is_redacted() {
        let mut rng = StdRng::seed_from_u64(13);
        let pair = EncryptionKeyPair::generate(&mut rng);
        let rendered = format!("{:?}", pair.secret());
        assert!(!rendered.contains(&pair.secret().to_base64()));
    }
}
