use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::encryption::CryptoError;
use crate::keys::{EncryptionPublicKey, EncryptionSecretKey, PeerKeys, SigningPublicKey};
use crate::ledger::types::{GameId, PeerId};
use crate::signing::{Signable, TranscriptBuilder};

/// A peer handing over its encryption secret once the game is over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDisclosureRequest {
    pub game_id: GameId,
    pub peer_id: PeerId,
    pub public_key: EncryptionPublicKey,
    pub private_key: EncryptionSecretKey,
    pub timestamp: Timestamp,
    pub signature: String,
}

impl Signable for KeyDisclosureRequest {
    fn domain_kind(&self) -> &'static str {
        "key_disclosure_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        builder.append_str(&self.game_id);
        builder.append_str(&self.peer_id);
        builder.append_bytes(self.public_key.as_bytes());
        builder.append_bytes(self.private_key.as_bytes());
        builder.append_i64(self.timestamp);
    }
}

impl KeyDisclosureRequest {
    pub fn new(game_id: impl Into<GameId>, keys: &PeerKeys, timestamp: Timestamp) -> Self {
        let mut request = Self {
            game_id: game_id.into(),
            peer_id: keys.peer_id.clone(),
            public_key: keys.encryption.public_key(),
            private_key: keys.encryption.secret().clone(),
            timestamp,
            signature: String::new(),
        };
        request.signature = request.sign_with(&keys.signing);
        request
    }

    pub fn verify(&self, key: &SigningPublicKey) -> Result<(), CryptoError> {
        self.verify_with(key, &self.signature)
    }

    /// Same peer, game and secret, ignoring when it was sent.
    pub fn discloses_same_key(&self, other: &KeyDisclosureRequest) -> bool {
        self.game_id == other.game_id
            && self.peer_id == other.peer_id
            && self.private_key.as_bytes() == other.private_key.as_bytes()
    }
}
