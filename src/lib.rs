pub mod clock;
pub mod config;
pub mod crypto_serde;
pub mod encryption;
pub mod error;
pub mod game;
pub mod keys;
pub mod ledger;
pub mod postgame;
pub mod proofs;
pub mod session;
pub mod shuffling;
pub mod signing;
pub mod tiles;
pub mod tokio_tools;

#[cfg(test)]
pub mod test_utils;

pub use config::FairnessConfig;
pub use error::{ErrorKind, FairnessError};
