//! Pairwise X25519 key agreement with ChaCha20-Poly1305, and onion-layered tiles.
//!
//! Every layer is sealed to one recipient under a fresh ephemeral key. Only the
//! outermost layer of an [`EncryptedTile`] carries ciphertext; inner layers keep
//! their nonce and ephemeral key and receive their ciphertext when the layer
//! above them is peeled.

mod error;

pub use error::CryptoError;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::instrument;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::crypto_serde::base64_bytes;
use crate::keys::{EncryptionPublicKey, EncryptionSecretKey};
use crate::tiles::Tile;

const LOG_TARGET: &str = "legit_mahjong::encryption";

const KDF_INFO: &[u8] = b"legit-mahjong/tile-layer/v1";
pub const NONCE_LEN: usize = 12;

/// One sealed layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    pub ephemeral_public_key: EncryptionPublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedTile {
    pub id: String,
    /// Remaining layers, innermost first.
    pub encrypted_data: Vec<EncryptedPayload>,
}

impl EncryptedTile {
    pub fn layer_count(&self) -> usize {
        self.encrypted_data.len()
    }
}

/// Result of removing one layer: either more layers remain or the tile is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeeledTile {
    Layered(EncryptedTile),
    Open(Tile),
}

fn derive_key(
    shared: &[u8; 32],
    ephemeral: &EncryptionPublicKey,
    recipient: &EncryptionPublicKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(KDF_INFO, &mut okm[..])
        .map_err(|err| CryptoError::Encryption(err.to_string()))?;
    Ok(okm)
}

/// Seals `plaintext` to `recipient` under a fresh ephemeral key and nonce.
pub fn encrypt<R: RngCore + CryptoRng>(
    rng: &mut R,
    plaintext: &[u8],
    recipient: &EncryptionPublicKey,
) -> Result<EncryptedPayload, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(&mut *rng);
    let ephemeral_public = EncryptionPublicKey::from_bytes(PublicKey::from(&ephemeral).to_bytes());
    let shared = ephemeral.diffie_hellman(&recipient.to_dalek());
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreement);
    }
    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient)?;

    let mut iv = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut iv);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: ephemeral_public.as_bytes(),
            },
        )
        .map_err(|err| CryptoError::Encryption(err.to_string()))?;

    Ok(EncryptedPayload {
        ciphertext,
        iv: iv.to_vec(),
        ephemeral_public_key: ephemeral_public,
    })
}

/// Opens a payload sealed to `secret`'s public key.
pub fn decrypt(
    payload: &EncryptedPayload,
    secret: &EncryptionSecretKey,
) -> Result<Vec<u8>, CryptoError> {
    if payload.iv.len() != NONCE_LEN {
        return Err(CryptoError::InvalidLength {
            field: "iv",
            expected: NONCE_LEN,
            actual: payload.iv.len(),
        });
    }
    let shared = secret
        .to_dalek()
        .diffie_hellman(&payload.ephemeral_public_key.to_dalek());
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreement);
    }
    let key = derive_key(
        shared.as_bytes(),
        &payload.ephemeral_public_key,
        &secret.public_key(),
    )?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .decrypt(
            Nonce::from_slice(&payload.iv),
            Payload {
                msg: &payload.ciphertext,
                aad: payload.ephemeral_public_key.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Authentication { layer: 0 })
}

/// Wraps `tile` in one layer per key, in the order the keys are given.
#[instrument(skip(rng, tile, recipients), level = "trace")]
pub fn encrypt_tile<R: RngCore + CryptoRng>(
    rng: &mut R,
    tile: Tile,
    recipients: &[EncryptionPublicKey],
) -> Result<EncryptedTile, CryptoError> {
    let mut layers: Vec<EncryptedPayload> = Vec::with_capacity(recipients.len());
    let mut current = tile.to_plaintext();
    for recipient in recipients {
        let payload = encrypt(rng, &current, recipient)?;
        current = payload.ciphertext.clone();
        layers.push(payload);
    }
    // Inner ciphertexts are recovered while peeling and never travel.
    let outer = layers.len().saturating_sub(1);
    for layer in layers.iter_mut().take(outer) {
        layer.ciphertext.clear();
    }
    Ok(EncryptedTile {
        id: uuid::Uuid::new_v4().to_string(),
        encrypted_data: layers,
    })
}

/// Removes the outermost layer with the holder's secret.
pub fn peel_layer(
    tile: &EncryptedTile,
    secret: &EncryptionSecretKey,
) -> Result<PeeledTile, CryptoError> {
    let mut layers = tile.encrypted_data.clone();
    let Some(outer) = layers.pop() else {
        return Err(CryptoError::LayerCountMismatch {
            expected: 0,
            actual: 1,
        });
    };
    let layer = layers.len();
    let opened =
        decrypt(&outer, secret).map_err(|err| relabel_layer(err, layer))?;

    match layers.last_mut() {
        Some(inner) => {
            inner.ciphertext = opened;
            Ok(PeeledTile::Layered(EncryptedTile {
                id: tile.id.clone(),
                encrypted_data: layers,
            }))
        }
        None => Tile::from_plaintext(&opened)
            .map(PeeledTile::Open)
            .map_err(|err| CryptoError::MalformedPlaintext(err.to_string())),
    }
}

/// Opens every layer. `secrets` must be ordered outermost first, i.e. the
/// reverse of the order used by [`encrypt_tile`].
#[instrument(skip(tile, secrets), fields(tile_id = %tile.id), level = "trace")]
pub fn decrypt_tile(
    tile: &EncryptedTile,
    secrets: &[&EncryptionSecretKey],
) -> Result<Tile, CryptoError> {
    if secrets.len() != tile.layer_count() {
        return Err(CryptoError::LayerCountMismatch {
            expected: tile.layer_count(),
            actual: secrets.len(),
        });
    }

    let mut current = tile.clone();
    for secret in secrets {
        match peel_layer(&current, secret)? {
            PeeledTile::Layered(next) => current = next,
            PeeledTile::Open(value) => return Ok(value),
        }
    }
    tracing::warn!(target: LOG_TARGET, tile_id = %tile.id, "tile still layered after all keys");
    Err(CryptoError::LayerCountMismatch {
        expected: tile.layer_count(),
        actual: secrets.len(),
    })
}

fn relabel_layer(err: CryptoError, layer: usize) -> CryptoError {
    match err {
        CryptoError::Authentication { .. } => CryptoError::Authentication { layer },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::EncryptionKeyPair;
    use crate::test_utils::serde::assert_round_trip_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn key_set(rng: &mut StdRng, n: usize) -> Vec<EncryptionKeyPair> {
        (0..n).map(|_| EncryptionKeyPair::generate(rng)).collect()
    }

    #[test]
    fn payload_round_trip_and_fresh_randomness() {
        let mut rng = StdRng::seed_from_u64(1);
        let pair = EncryptionKeyPair::generate(&mut rng);
        let a = encrypt(&mut rng, b"3s", &pair.public_key()).unwrap();
        let b = encrypt(&mut rng, b"3s", &pair.public_key()).unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.ephemeral_public_key, b.ephemeral_public_key);
        assert_eq!(decrypt(&a, pair.secret()).unwrap(), b"3s");
        assert_eq!(decrypt(&b, pair.secret()).unwrap(), b"3s");
    }

    #[test]
    fn wrong_key_or_tampering_fails_authentication() {
        let mut rng = StdRng::seed_from_u64(2);
        let pair = EncryptionKeyPair::generate(&mut rng);
        let other = EncryptionKeyPair::generate(&mut rng);
        let mut payload = encrypt(&mut rng, b"W", &pair.public_key()).unwrap();
        assert_eq!(
            decrypt(&payload, other.secret()),
            Err(CryptoError::Authentication { layer: 0 })
        );
        payload.ciphertext[0] ^= 0x01;
        assert_eq!(
            decrypt(&payload, pair.secret()),
            Err(CryptoError::Authentication { layer: 0 })
        );
    }

    #[test]
    fn layered_tile_round_trips_in_reverse_order() {
        let mut rng = StdRng::seed_from_u64(3);
        for n in [1usize, 3, 4] {
            let keys = key_set(&mut rng, n);
            let publics: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
            let tile: Tile = "9p".parse().unwrap();
            let encrypted = encrypt_tile(&mut rng, tile, &publics).unwrap();
            assert_eq!(encrypted.layer_count(), n);
            assert!(encrypted.encrypted_data[..n - 1]
                .iter()
                .all(|layer| layer.ciphertext.is_empty()));

            let reversed: Vec<_> = keys.iter().rev().map(|k| k.secret()).collect();
            assert_eq!(decrypt_tile(&encrypted, &reversed).unwrap(), tile);
        }
    }

    #[test]
    fn out_of_order_and_miscounted_keys_fail() {
        let mut rng = StdRng::seed_from_u64(4);
        let keys = key_set(&mut rng, 3);
        let publics: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
        let encrypted = encrypt_tile(&mut rng, "C".parse().unwrap(), &publics).unwrap();

        let in_order: Vec<_> = keys.iter().map(|k| k.secret()).collect();
        assert_eq!(
            decrypt_tile(&encrypted, &in_order),
            Err(CryptoError::Authentication { layer: 2 })
        );
        assert_eq!(
            decrypt_tile(&encrypted, &in_order[..2]),
            Err(CryptoError::LayerCountMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn peeling_removes_exactly_one_layer() {
        let mut rng = StdRng::seed_from_u64(5);
        let keys = key_set(&mut rng, 2);
        let publics: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
        let tile: Tile = "1m".parse().unwrap();
        let encrypted = encrypt_tile(&mut rng, tile, &publics).unwrap();

        let PeeledTile::Layered(inner) = peel_layer(&encrypted, keys[1].secret()).unwrap() else {
            panic!("expected a remaining layer");
        };
        assert_eq!(inner.layer_count(), 1);
        assert_eq!(inner.id, encrypted.id);
        assert!(!inner.encrypted_data[0].ciphertext.is_empty());
        assert_eq!(
            peel_layer(&inner, keys[0].secret()).unwrap(),
            PeeledTile::Open(tile)
        );
    }

    #[test]
    fn encrypted_tile_wire_shape() {
        let mut rng = StdRng::seed_from_u64(6);
        let keys = key_set(&mut rng, 2);
        let publics: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
        let encrypted = encrypt_tile(&mut rng, "5s".parse().unwrap(), &publics).unwrap();
        let json = serde_json::to_value(&encrypted).unwrap();
        let layer = &json["encryptedData"][1];
        assert!(layer["ciphertext"].is_string());
        assert!(layer["iv"].is_string());
        assert_eq!(layer["ephemeralPublicKey"]["kty"], "OKP");
        assert_round_trip_eq(&encrypted);
    }
}
