use serde::{Deserialize, Serialize};

use crate::game::{GameAction, StateSummary};
use crate::keys::PeerPublicKeys;
use crate::ledger::types::PeerId;
use crate::postgame::KeyDisclosureRequest;
use crate::proofs::DecryptionProof;
use crate::shuffling::EncryptedDeck;

/// Everything peers exchange during one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    /// Key announcement at table setup.
    Announce(PeerPublicKeys),
    /// The deck after the sender's shuffle pass.
    DeckHandoff(EncryptedDeck),
    Action(GameAction),
    DecryptionProof(DecryptionProof),
    KeyDisclosure(KeyDisclosureRequest),
    StateSync(StateSummary),
    Abort { reason: String },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Announce(_) => "announce",
            PeerMessage::DeckHandoff(_) => "deck_handoff",
            PeerMessage::Action(_) => "action",
            PeerMessage::DecryptionProof(_) => "decryption_proof",
            PeerMessage::KeyDisclosure(_) => "key_disclosure",
            PeerMessage::StateSync(_) => "state_sync",
            PeerMessage::Abort { .. } => "abort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from: PeerId,
    pub message: PeerMessage,
}
