use serde::{Deserialize, Serialize};

use crate::error::FairnessError;

const ENV_PREFIX: &str = "LEGIT_MAHJONG_";

/// Protocol constants shared by every service of a game session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FairnessConfig {
    /// Number of recently accepted action ids remembered by the replay guard.
    pub replay_capacity: usize,
    /// Maximum allowed |now - action.timestamp| in milliseconds.
    pub timestamp_tolerance_ms: i64,
    /// Points each player starts with; final scores must sum to this times the player count.
    pub starting_points: i64,
    /// Copies of each of the 34 tile kinds in a complete deck.
    pub copies_per_kind: usize,
    pub min_peers: usize,
    pub max_peers: usize,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 1000,
            timestamp_tolerance_ms: 5 * 60 * 1000,
            starting_points: 25_000,
            copies_per_kind: 4,
            min_peers: 3,
            max_peers: 4,
        }
    }
}

impl FairnessConfig {
    /// Defaults overridden by `LEGIT_MAHJONG_*` environment variables.
    pub fn from_env() -> Result<Self, FairnessError> {
        let mut config = Self::default();
        if let Some(value) = read_env("REPLAY_CAPACITY")? {
            config.replay_capacity = value;
        }
        if let Some(value) = read_env("TIMESTAMP_TOLERANCE_MS")? {
            config.timestamp_tolerance_ms = value;
        }
        if let Some(value) = read_env("STARTING_POINTS")? {
            config.starting_points = value;
        }
        if let Some(value) = read_env("COPIES_PER_KIND")? {
            config.copies_per_kind = value;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FairnessError> {
        if self.replay_capacity == 0 {
            return Err(FairnessError::config("replay capacity must be positive"));
        }
        if self.timestamp_tolerance_ms <= 0 {
            return Err(FairnessError::config("timestamp tolerance must be positive"));
        }
        if self.copies_per_kind == 0 {
            return Err(FairnessError::config("copies per kind must be positive"));
        }
        if self.min_peers < 2 || self.min_peers > self.max_peers {
            return Err(FairnessError::config(format!(
                "invalid peer range {}..={}",
                self.min_peers, self.max_peers
            )));
        }
        Ok(())
    }

    pub fn allows_peer_count(&self, count: usize) -> bool {
        (self.min_peers..=self.max_peers).contains(&count)
    }

    pub fn expected_score_total(&self, players: usize) -> i64 {
        self.starting_points * players as i64
    }

    pub fn deck_size(&self) -> usize {
        crate::tiles::TILE_KIND_COUNT * self.copies_per_kind
    }
}

fn read_env<T>(suffix: &str) -> Result<Option<T>, FairnessError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{suffix}");
    match std::env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| FairnessError::config(format!("{name}: {err}"))),
        Err(_) => Ok(None),
    }
}
