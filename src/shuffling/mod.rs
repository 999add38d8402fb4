//! Layered-encryption shuffle: deck types, permutations and the round-robin
//! orchestrator.

mod deck;
mod error;
mod orchestrator;
pub mod permutation;


pub use deck::{EncryptedDeck, ShuffleRecord};
pub use error::ShuffleError;
pub use orchestrator::{verify_deck_history, ShuffleOrchestrator, ShufflePhase};
