//! Post-game verification: key disclosure, full deck decryption and replay.
//!
//! Phases run `idle -> collecting-keys -> verifying -> completed | failed` and
//! never move backward. Deck composition or final-state failures end in
//! `failed` with the assembled result kept; invalid actions complete with
//! `success == false`.

mod disclosure;
mod error;
pub mod hands;
mod pipeline;
mod report;
mod state;

#[cfg(test)]
mod tests;

pub use disclosure::KeyDisclosureRequest;
pub use error::PostGameError;
pub use hands::{HandReplay, HandViolation};
pub use pipeline::{PostGameVerifier, SubmitOutcome};
pub use report::{
    EndCondition, FinalGameState, HandHistory, PostGameExport, VerificationData,
    VerificationProof, VerificationResult, VerificationSummary,
};
pub use state::{PostGameEvent, PostGameState, VerificationPhase};
