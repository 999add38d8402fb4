//! Round-robin shuffle over the seated peers.
//!
//! The first peer permutes the plaintext tiles and seals every tile under all
//! peers' encryption keys in seat order. Each later peer only permutes the
//! sealed tiles and signs the permutation; no layers are added after the first
//! pass.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::deck::{EncryptedDeck, ShuffleRecord};
use super::error::ShuffleError;
use super::permutation::{apply_permutation, is_permutation, random_permutation};
use crate::clock::{SharedClock, Timestamp};
use crate::config::FairnessConfig;
use crate::encryption::encrypt_tile;
use crate::keys::{EncryptionPublicKey, PeerKeys, PeerPublicKeys};
use crate::tiles::Tile;

const LOG_TARGET: &str = "legit_mahjong::shuffling";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum ShufflePhase {
    Uninitialized,
    /// `round` is the seat index whose turn it is.
    Shuffling { round: usize },
    Complete,
    Aborted { reason: String },
}

struct ShuffleState {
    phase: ShufflePhase,
    deck: Option<EncryptedDeck>,
}

pub struct ShuffleOrchestrator {
    participants: Vec<PeerPublicKeys>,
    deck_size: usize,
    clock: SharedClock,
    state: Mutex<ShuffleState>,
}

impl ShuffleOrchestrator {
    /// `participants` is the seat order; it fixes both turn order and layer order.
    pub fn new(
        participants: Vec<PeerPublicKeys>,
        config: &FairnessConfig,
        clock: SharedClock,
    ) -> Result<Self, ShuffleError> {
        check_participants(&participants, config)?;
        Ok(Self {
            participants,
            deck_size: config.deck_size(),
            clock,
            state: Mutex::new(ShuffleState {
                phase: ShufflePhase::Uninitialized,
                deck: None,
            }),
        })
    }

    pub fn participants(&self) -> &[PeerPublicKeys] {
        &self.participants
    }

    pub fn phase(&self) -> ShufflePhase {
        self.state.lock().phase.clone()
    }

    pub fn deck(&self) -> Option<EncryptedDeck> {
        self.state.lock().deck.clone()
    }

    pub fn shuffle_history(&self) -> Vec<ShuffleRecord> {
        self.state
            .lock()
            .deck
            .as_ref()
            .map(|deck| deck.shuffle_history.clone())
            .unwrap_or_default()
    }

    /// Peer expected to act next, if the shuffle is still open.
    pub fn current_peer(&self) -> Option<&str> {
        let round = match self.state.lock().phase {
            ShufflePhase::Uninitialized => 0,
            ShufflePhase::Shuffling { round } => round,
            _ => return None,
        };
        self.participants.get(round).map(|peer| peer.peer_id.as_str())
    }

    pub fn is_shuffle_complete(&self) -> bool {
        let state = self.state.lock();
        state
            .deck
            .as_ref()
            .is_some_and(|deck| deck.encryption_order.len() == self.participants.len())
    }

    /// First pass: permute the plaintext and seal every tile under all peers'
    /// keys in seat order.
    #[instrument(skip(self, rng, tiles, keys), fields(peer_id = %keys.peer_id), level = "trace")]
    pub fn initialize_deck<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        tiles: Vec<Tile>,
        keys: &PeerKeys,
    ) -> Result<EncryptedDeck, ShuffleError> {
        let mut state = self.state.lock();
        match &state.phase {
            ShufflePhase::Uninitialized => {}
            ShufflePhase::Aborted { reason } => return Err(ShuffleError::Aborted(reason.clone())),
            _ => return Err(self.rejected(ShuffleError::AlreadyInitialized)),
        }
        self.check_turn(keys, 0).map_err(|err| self.rejected(err))?;
        if tiles.len() != self.deck_size {
            return Err(self.rejected(ShuffleError::InvalidDeckSize {
                expected: self.deck_size,
                actual: tiles.len(),
            }));
        }

        let indices = random_permutation(rng, tiles.len());
        let recipients: Vec<EncryptionPublicKey> = self
            .participants
            .iter()
            .map(|peer| peer.encryption_key)
            .collect();
        let mut sealed = Vec::with_capacity(tiles.len());
        for &source in &indices {
            sealed.push(encrypt_tile(rng, tiles[source as usize], &recipients)?);
        }

        let record = ShuffleRecord::signed(
            keys.peer_id.clone(),
            self.next_timestamp(None),
            indices,
            &keys.signing,
        );
        let deck = EncryptedDeck {
            tiles: sealed,
            shuffle_history: vec![record],
            encryption_order: vec![keys.peer_id.clone()],
        };
        self.install(&mut state, deck.clone(), 0);
        Ok(deck)
    }

    /// Later passes: permute the sealed tiles and sign the permutation.
    #[instrument(skip(self, rng, keys), fields(peer_id = %keys.peer_id), level = "trace")]
    pub fn perform_current_player_shuffle<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        keys: &PeerKeys,
    ) -> Result<EncryptedDeck, ShuffleError> {
        let mut state = self.state.lock();
        let round = open_round(&state.phase)?;
        let Some(current) = state.deck.as_ref() else {
            return Err(self.rejected(ShuffleError::NotInitialized));
        };
        if round == 0 {
            return Err(self.rejected(ShuffleError::NotInitialized));
        }
        self.check_turn(keys, round).map_err(|err| self.rejected(err))?;

        let indices = random_permutation(rng, current.len());
        let tiles = apply_permutation(&current.tiles, &indices)
            .ok_or_else(|| ShuffleError::InvalidDeckSize {
                expected: self.deck_size,
                actual: current.len(),
            })?;
        let record = ShuffleRecord::signed(
            keys.peer_id.clone(),
            self.next_timestamp(current.last_timestamp()),
            indices,
            &keys.signing,
        );

        let mut deck = EncryptedDeck {
            tiles,
            shuffle_history: current.shuffle_history.clone(),
            encryption_order: current.encryption_order.clone(),
        };
        deck.shuffle_history.push(record);
        deck.encryption_order.push(keys.peer_id.clone());
        self.install(&mut state, deck.clone(), round);
        Ok(deck)
    }

    /// Adopts a deck produced by the peer whose turn it was, after checking it
    /// extends the local history by exactly that peer's signed pass.
    #[instrument(skip(self, deck), level = "trace")]
    pub fn accept_remote_deck(&self, deck: EncryptedDeck) -> Result<(), ShuffleError> {
        let mut state = self.state.lock();
        let round = match &state.phase {
            ShufflePhase::Uninitialized => 0,
            phase => open_round(phase)?,
        };
        self.check_extension(state.deck.as_ref(), &deck, round)
            .map_err(|err| self.rejected(err))?;
        self.install(&mut state, deck, round);
        Ok(())
    }

    /// Terminal. Later shuffle calls fail with [`ShuffleError::Aborted`].
    pub fn abort(&self, reason: impl Into<String>) -> Result<(), ShuffleError> {
        let mut state = self.state.lock();
        match &state.phase {
            ShufflePhase::Complete => Err(ShuffleError::Complete),
            ShufflePhase::Aborted { reason } => Err(ShuffleError::Aborted(reason.clone())),
            _ => {
                let reason = reason.into();
                warn!(target: LOG_TARGET, reason = %reason, "shuffle aborted");
                state.phase = ShufflePhase::Aborted { reason };
                Ok(())
            }
        }
    }

    fn install(&self, state: &mut ShuffleState, deck: EncryptedDeck, round: usize) {
        let next = round + 1;
        state.phase = if next == self.participants.len() {
            ShufflePhase::Complete
        } else {
            ShufflePhase::Shuffling { round: next }
        };
        info!(
            target: LOG_TARGET,
            round,
            peer_id = %self.participants[round].peer_id,
            complete = matches!(state.phase, ShufflePhase::Complete),
            "shuffle round recorded"
        );
        state.deck = Some(deck);
    }

    fn check_turn(&self, keys: &PeerKeys, round: usize) -> Result<(), ShuffleError> {
        let expected = &self.participants[round];
        if keys.peer_id != expected.peer_id {
            if !self.participants.iter().any(|peer| peer.peer_id == keys.peer_id) {
                return Err(ShuffleError::UnknownPeer(keys.peer_id.clone()));
            }
            return Err(ShuffleError::OutOfTurn {
                expected: expected.peer_id.clone(),
                actual: keys.peer_id.clone(),
            });
        }
        if keys.signing.public_key() != expected.signing_key {
            return Err(ShuffleError::UnknownPeer(keys.peer_id.clone()));
        }
        Ok(())
    }

    fn check_extension(
        &self,
        local: Option<&EncryptedDeck>,
        remote: &EncryptedDeck,
        round: usize,
    ) -> Result<(), ShuffleError> {
        if remote.rounds() != round + 1 {
            return Err(ShuffleError::remote(format!(
                "expected {} shuffle records, got {}",
                round + 1,
                remote.rounds()
            )));
        }
        if !remote.order_matches_history() {
            return Err(ShuffleError::remote("encryption order disagrees with history"));
        }
        let Some(record) = remote.shuffle_history.last() else {
            return Err(ShuffleError::remote("empty shuffle history"));
        };
        let expected = &self.participants[round];
        if record.peer_id != expected.peer_id {
            return Err(ShuffleError::OutOfTurn {
                expected: expected.peer_id.clone(),
                actual: record.peer_id.clone(),
            });
        }
        record
            .verify(&expected.signing_key)
            .map_err(|_| ShuffleError::remote(format!("bad signature from {}", record.peer_id)))?;
        self.check_tiles(remote)?;

        match local {
            None => {
                if !is_permutation(&record.shuffle_indices, self.deck_size) {
                    return Err(ShuffleError::remote("first pass indices are not a permutation"));
                }
            }
            Some(local) => {
                if remote.shuffle_history[..round] != local.shuffle_history[..] {
                    return Err(ShuffleError::remote("history diverges from local deck"));
                }
                if local
                    .last_timestamp()
                    .is_some_and(|last| record.timestamp <= last)
                {
                    return Err(ShuffleError::remote("shuffle timestamps must increase"));
                }
                let expected_tiles = apply_permutation(&local.tiles, &record.shuffle_indices)
                    .ok_or_else(|| ShuffleError::remote("indices are not a permutation"))?;
                if expected_tiles != remote.tiles {
                    return Err(ShuffleError::remote(
                        "tiles are not the recorded permutation of the previous deck",
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_tiles(&self, deck: &EncryptedDeck) -> Result<(), ShuffleError> {
        if deck.len() != self.deck_size {
            return Err(ShuffleError::InvalidDeckSize {
                expected: self.deck_size,
                actual: deck.len(),
            });
        }
        if !deck.has_unique_ids() {
            return Err(ShuffleError::remote("duplicate tile ids"));
        }
        let layers = self.participants.len();
        if let Some(tile) = deck.tiles.iter().find(|tile| tile.layer_count() != layers) {
            return Err(ShuffleError::remote(format!(
                "tile {} has {} layers, expected {layers}",
                tile.id,
                tile.layer_count()
            )));
        }
        Ok(())
    }

    fn next_timestamp(&self, last: Option<Timestamp>) -> Timestamp {
        let now = self.clock.now_millis();
        match last {
            Some(last) => now.max(last + 1),
            None => now,
        }
    }

    fn rejected(&self, err: ShuffleError) -> ShuffleError {
        warn!(target: LOG_TARGET, error = %err, "shuffle step rejected");
        err
    }
}

fn open_round(phase: &ShufflePhase) -> Result<usize, ShuffleError> {
    match phase {
        ShufflePhase::Uninitialized => Err(ShuffleError::NotInitialized),
        ShufflePhase::Shuffling { round } => Ok(*round),
        ShufflePhase::Complete => Err(ShuffleError::Complete),
        ShufflePhase::Aborted { reason } => Err(ShuffleError::Aborted(reason.clone())),
    }
}

fn check_participants(
    participants: &[PeerPublicKeys],
    config: &FairnessConfig,
) -> Result<(), ShuffleError> {
    if !config.allows_peer_count(participants.len()) {
        return Err(ShuffleError::InvalidPeerCount {
            min: config.min_peers,
            max: config.max_peers,
            actual: participants.len(),
        });
    }
    let mut seen = HashSet::new();
    for peer in participants {
        if !seen.insert(peer.peer_id.as_str()) {
            return Err(ShuffleError::DuplicatePeer(peer.peer_id.clone()));
        }
    }
    Ok(())
}

/// Re-checks a finished deck: one signed pass per participant in seat order,
/// strictly increasing timestamps, and fully layered unique tiles.
pub fn verify_deck_history(
    deck: &EncryptedDeck,
    participants: &[PeerPublicKeys],
    config: &FairnessConfig,
) -> Result<(), ShuffleError> {
    check_participants(participants, config)?;
    if deck.rounds() != participants.len() || !deck.order_matches_history() {
        return Err(ShuffleError::remote(format!(
            "expected {} shuffle passes, got {}",
            participants.len(),
            deck.rounds()
        )));
    }
    let mut last: Option<Timestamp> = None;
    for (record, peer) in deck.shuffle_history.iter().zip(participants) {
        if record.peer_id != peer.peer_id {
            return Err(ShuffleError::OutOfTurn {
                expected: peer.peer_id.clone(),
                actual: record.peer_id.clone(),
            });
        }
        record
            .verify(&peer.signing_key)
            .map_err(|_| ShuffleError::remote(format!("bad signature from {}", record.peer_id)))?;
        if last.is_some_and(|last| record.timestamp <= last) {
            return Err(ShuffleError::remote("shuffle timestamps must increase"));
        }
        if !is_permutation(&record.shuffle_indices, deck.len()) {
            return Err(ShuffleError::remote(format!(
                "indices from {} are not a permutation",
                record.peer_id
            )));
        }
        last = Some(record.timestamp);
    }
    if deck.len() != config.deck_size() {
        return Err(ShuffleError::InvalidDeckSize {
            expected: config.deck_size(),
            actual: deck.len(),
        });
    }
    if !deck.has_unique_ids() {
        return Err(ShuffleError::remote("duplicate tile ids"));
    }
    if deck
        .tiles
        .iter()
        .any(|tile| tile.layer_count() != participants.len())
    {
        return Err(ShuffleError::remote("tile layer count differs from peer count"));
    }
    Ok(())
}
