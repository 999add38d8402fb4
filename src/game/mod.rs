//! Game-facing types: signed actions, the rules-engine seam and state reconciliation.

pub mod actions;
pub mod conflict;
pub mod judge;

pub use actions::{
    ActionDraft, ActionPayload, ActionType, ClaimData, DecryptProofData, DiscardData, DrawData,
    GameAction, GameStartData, KanData, KanType, RiichiData, ShuffleData, WinData, WinType,
};
pub use conflict::{DefaultStateConflictResolver, Resolution, StateConflictResolver, StateSummary};
pub use judge::{HandJudge, Meld, MeldKind, PermissiveJudge, StructuralJudge};
