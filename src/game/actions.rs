use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Timestamp;
use crate::keys::SigningPublicKey;
use crate::ledger::types::{ActionId, PeerId};
use crate::ledger::VerifyError;
use crate::signing::{Signable, TranscriptBuilder};
use crate::tiles::Tile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    GameStart,
    Shuffle,
    Draw,
    Discard,
    Pon,
    Chi,
    Kan,
    Riichi,
    Win,
    DecryptProof,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::GameStart => "GAME_START",
            ActionType::Shuffle => "SHUFFLE",
            ActionType::Draw => "DRAW",
            ActionType::Discard => "DISCARD",
            ActionType::Pon => "PON",
            ActionType::Chi => "CHI",
            ActionType::Kan => "KAN",
            ActionType::Riichi => "RIICHI",
            ActionType::Win => "WIN",
            ActionType::DecryptProof => "DECRYPT_PROOF",
        }
    }
}

/// A signed in-game action as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameAction {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub peer_id: PeerId,
    pub timestamp: Timestamp,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Signable for GameAction {
    fn domain_kind(&self) -> &'static str {
        "game_action_v1"
    }

    fn write_transcript(&self, builder: &mut TranscriptBuilder) {
        builder.append_str(&self.id);
        builder.append_str(self.action_type.as_str());
        builder.append_str(&self.peer_id);
        builder.append_i64(self.timestamp);
        builder.append_json(&self.data);
    }
}

impl GameAction {
    pub fn payload(&self) -> Result<ActionPayload, serde_json::Error> {
        ActionPayload::decode(self.action_type, &self.data)
    }

    /// Checks the signature alone: no replay or clock checks.
    pub fn verify_signature(&self, key: &SigningPublicKey) -> Result<(), VerifyError> {
        let signature = self
            .signature
            .as_deref()
            .ok_or_else(|| VerifyError::MissingSignature {
                action_id: self.id.clone(),
            })?;
        self.verify_with(key, signature).map_err(|err| match err {
            crate::encryption::CryptoError::Signature => VerifyError::BadSignature {
                action_id: self.id.clone(),
            },
            other => VerifyError::MalformedSignature {
                action_id: self.id.clone(),
                reason: other.to_string(),
            },
        })
    }
}

/// An action before signing. Missing id and timestamp are filled in at signing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDraft {
    pub id: Option<ActionId>,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub peer_id: PeerId,
    pub timestamp: Option<Timestamp>,
    pub data: Value,
}

impl ActionDraft {
    pub fn new(peer_id: impl Into<PeerId>, payload: &ActionPayload) -> Self {
        Self {
            id: None,
            action_type: payload.action_type(),
            peer_id: peer_id.into(),
            timestamp: None,
            data: payload.to_value(),
        }
    }

    pub fn with_id(mut self, id: impl Into<ActionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStartData {
    pub players: Vec<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShuffleData {
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawData {
    pub tile_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscardData {
    pub tile_index: u32,
    pub tile: Tile,
}

/// Pon or chi on another peer's discard, using deck positions from the claimant's hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimData {
    pub target_peer_id: PeerId,
    pub discarded_tile_index: u32,
    pub hand_tiles: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KanType {
    /// Four held tiles.
    Closed,
    /// Three held tiles plus a claimed discard.
    Open,
    /// One held tile added to an existing pon.
    Added,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KanData {
    #[serde(rename = "type")]
    pub kan_type: KanType,
    pub tile_indices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discarded_tile_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiichiData {
    pub discard_tile_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WinType {
    Tsumo,
    Ron,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinData {
    pub win_type: WinType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    /// Concealed tiles including the winning tile.
    pub hand_tiles: Vec<Tile>,
    pub win_tile: Tile,
    /// Deck position of the claimed discard for a ron.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_tile_index: Option<u32>,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptProofData {
    pub tile_index: u32,
    pub tile: Tile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPayload {
    GameStart(GameStartData),
    Shuffle(ShuffleData),
    Draw(DrawData),
    Discard(DiscardData),
    Pon(ClaimData),
    Chi(ClaimData),
    Kan(KanData),
    Riichi(RiichiData),
    Win(WinData),
    DecryptProof(DecryptProofData),
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionPayload::GameStart(_) => ActionType::GameStart,
            ActionPayload::Shuffle(_) => ActionType::Shuffle,
            ActionPayload::Draw(_) => ActionType::Draw,
            ActionPayload::Discard(_) => ActionType::Discard,
            ActionPayload::Pon(_) => ActionType::Pon,
            ActionPayload::Chi(_) => ActionType::Chi,
            ActionPayload::Kan(_) => ActionType::Kan,
            ActionPayload::Riichi(_) => ActionType::Riichi,
            ActionPayload::Win(_) => ActionType::Win,
            ActionPayload::DecryptProof(_) => ActionType::DecryptProof,
        }
    }

    pub fn decode(action_type: ActionType, data: &Value) -> Result<Self, serde_json::Error> {
        let data = data.clone();
        Ok(match action_type {
            ActionType::GameStart => ActionPayload::GameStart(serde_json::from_value(data)?),
            ActionType::Shuffle => ActionPayload::Shuffle(serde_json::from_value(data)?),
            ActionType::Draw => ActionPayload::Draw(serde_json::from_value(data)?),
            ActionType::Discard => ActionPayload::Discard(serde_json::from_value(data)?),
            ActionType::Pon => ActionPayload::Pon(serde_json::from_value(data)?),
            ActionType::Chi => ActionPayload::Chi(serde_json::from_value(data)?),
            ActionType::Kan => ActionPayload::Kan(serde_json::from_value(data)?),
            ActionType::Riichi => ActionPayload::Riichi(serde_json::from_value(data)?),
            ActionType::Win => ActionPayload::Win(serde_json::from_value(data)?),
            ActionType::DecryptProof => {
                ActionPayload::DecryptProof(serde_json::from_value(data)?)
            }
        })
    }

    pub fn to_value(&self) -> Value {
        let encoded = match self {
            ActionPayload::GameStart(data) => serde_json::to_value(data),
            ActionPayload::Shuffle(data) => serde_json::to_value(data),
            ActionPayload::Draw(data) => serde_json::to_value(data),
            ActionPayload::Discard(data) => serde_json::to_value(data),
            ActionPayload::Pon(data) | ActionPayload::Chi(data) => serde_json::to_value(data),
            ActionPayload::Kan(data) => serde_json::to_value(data),
            ActionPayload::Riichi(data) => serde_json::to_value(data),
            ActionPayload::Win(data) => serde_json::to_value(data),
            ActionPayload::DecryptProof(data) => serde_json::to_value(data),
        };
        // Plain structs with string keys always encode.
        encoded.unwrap_or(Value::Null)
    }
}
