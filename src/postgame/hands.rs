//! Replays logged actions against the decrypted deck to rebuild every hand.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::report::HandHistory;
use crate::game::{
    ActionPayload, ClaimData, DiscardData, HandJudge, KanData, KanType, Meld, MeldKind, WinData,
    WinType,
};
use crate::ledger::types::PeerId;
use crate::tiles::Tile;

/// Tiles dealt to the dealer; every other seat gets one fewer.
pub const DEALER_HAND: usize = 14;
pub const HAND: usize = 13;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandViolation {
    #[error("peer {0} is not seated")]
    NotSeated(PeerId),
    #[error("deck position {0} does not exist")]
    NoSuchPosition(u32),
    #[error("deck position {0} was already dealt or drawn")]
    AlreadyTaken(u32),
    #[error("deck position {0} is not in the peer's hand")]
    NotHeld(u32),
    #[error("position {position} holds {actual}, action claims {claimed}")]
    WrongTile {
        position: u32,
        claimed: Tile,
        actual: Tile,
    },
    #[error("position {position} is not the latest discard of {target}")]
    NotLatestDiscard { target: PeerId, position: u32 },
    #[error("cannot claim own discard")]
    OwnDiscard,
    #[error("{0:?} meld rejected by the rules engine")]
    InvalidMeld(MeldKind),
    #[error("added kan needs a pon of {0}")]
    NoMatchingPon(Tile),
    #[error("claimed winning hand differs from reconstructed holdings")]
    HandMismatch,
    #[error("winning tile {0} is not part of the claimed hand")]
    WinTileMissing(Tile),
    #[error("hand is not a winning hand")]
    NotWinning,
    #[error("ron needs a target peer and the discard position")]
    IncompleteRon,
}

struct HeldMeld {
    kind: MeldKind,
    positions: Vec<u32>,
}

#[derive(Default)]
struct SeatHand {
    concealed: BTreeSet<u32>,
    melds: Vec<HeldMeld>,
    riichi: bool,
    history: HandHistory,
}

pub struct HandReplay<'a> {
    deck: &'a [Tile],
    judge: &'a dyn HandJudge,
    seats: BTreeMap<PeerId, SeatHand>,
    taken: BTreeSet<u32>,
    last_discard: Option<(PeerId, u32)>,
    winner: Option<PeerId>,
}

impl<'a> HandReplay<'a> {
    /// Deals consecutive deck positions: the dealer (seat 0) first, then each
    /// further seat in order.
    pub fn deal(
        deck: &'a [Tile],
        seats: &[PeerId],
        judge: &'a dyn HandJudge,
    ) -> Result<Self, HandViolation> {
        let mut replay = Self {
            deck,
            judge,
            seats: BTreeMap::new(),
            taken: BTreeSet::new(),
            last_discard: None,
            winner: None,
        };
        let mut next = 0u32;
        for (seat, peer) in seats.iter().enumerate() {
            let count = if seat == 0 { DEALER_HAND } else { HAND };
            let mut hand = SeatHand::default();
            for _ in 0..count {
                replay.tile(next)?;
                hand.concealed.insert(next);
                replay.taken.insert(next);
                next += 1;
            }
            replay.seats.insert(peer.clone(), hand);
        }
        for peer in seats {
            replay.snapshot(peer);
        }
        Ok(replay)
    }

    pub fn winner(&self) -> Option<&PeerId> {
        self.winner.as_ref()
    }

    pub fn is_riichi(&self, peer: &str) -> bool {
        self.seats.get(peer).is_some_and(|seat| seat.riichi)
    }

    /// Concealed tiles of `peer`, sorted.
    pub fn concealed(&self, peer: &str) -> Vec<Tile> {
        self.seats
            .get(peer)
            .map(|seat| self.tiles_at(&seat.concealed))
            .unwrap_or_default()
    }

    pub fn into_histories(self) -> BTreeMap<PeerId, HandHistory> {
        self.seats
            .into_iter()
            .map(|(peer, seat)| (peer, seat.history))
            .collect()
    }

    /// Applies one action. A rejected action leaves the replay untouched.
    pub fn apply(&mut self, peer: &str, payload: &ActionPayload) -> Result<(), HandViolation> {
        if !self.seats.contains_key(peer) {
            return Err(HandViolation::NotSeated(peer.to_string()));
        }
        match payload {
            ActionPayload::GameStart(_) | ActionPayload::Shuffle(_) => return Ok(()),
            ActionPayload::DecryptProof(data) => {
                return self.expect_tile(data.tile_index, data.tile);
            }
            ActionPayload::Draw(data) => self.draw(peer, data.tile_index)?,
            ActionPayload::Discard(data) => self.discard(peer, data)?,
            ActionPayload::Pon(data) => self.claim(peer, MeldKind::Pon, data)?,
            ActionPayload::Chi(data) => self.claim(peer, MeldKind::Chi, data)?,
            ActionPayload::Kan(data) => self.kan(peer, data)?,
            ActionPayload::Riichi(data) => {
                self.require_held(peer, &[data.discard_tile_index])?;
                self.seat_mut(peer).riichi = true;
                return Ok(());
            }
            ActionPayload::Win(data) => return self.win(peer, data),
        }
        self.snapshot(peer);
        Ok(())
    }

    fn draw(&mut self, peer: &str, position: u32) -> Result<(), HandViolation> {
        self.tile(position)?;
        if self.taken.contains(&position) {
            return Err(HandViolation::AlreadyTaken(position));
        }
        self.taken.insert(position);
        self.seat_mut(peer).concealed.insert(position);
        Ok(())
    }

    fn discard(&mut self, peer: &str, data: &DiscardData) -> Result<(), HandViolation> {
        self.require_held(peer, &[data.tile_index])?;
        self.expect_tile(data.tile_index, data.tile)?;
        self.seat_mut(peer).concealed.remove(&data.tile_index);
        self.last_discard = Some((peer.to_string(), data.tile_index));
        Ok(())
    }

    fn claim(&mut self, peer: &str, kind: MeldKind, data: &ClaimData) -> Result<(), HandViolation> {
        self.require_discard(peer, &data.target_peer_id, data.discarded_tile_index)?;
        self.require_held(peer, &data.hand_tiles)?;
        let mut positions = data.hand_tiles.clone();
        positions.push(data.discarded_tile_index);
        self.require_meld(kind, &positions)?;
        self.form_meld(peer, kind, &data.hand_tiles, positions);
        Ok(())
    }

    fn kan(&mut self, peer: &str, data: &KanData) -> Result<(), HandViolation> {
        self.require_held(peer, &data.tile_indices)?;
        match data.kan_type {
            KanType::Closed => {
                self.require_meld(MeldKind::Kan, &data.tile_indices)?;
                self.form_meld(peer, MeldKind::Kan, &data.tile_indices, data.tile_indices.clone());
            }
            KanType::Open => {
                let (Some(target), Some(position)) =
                    (data.target_peer_id.as_ref(), data.discarded_tile_index)
                else {
                    return Err(HandViolation::NotLatestDiscard {
                        target: data.target_peer_id.clone().unwrap_or_default(),
                        position: data.discarded_tile_index.unwrap_or_default(),
                    });
                };
                self.require_discard(peer, target, position)?;
                let mut positions = data.tile_indices.clone();
                positions.push(position);
                self.require_meld(MeldKind::Kan, &positions)?;
                self.form_meld(peer, MeldKind::Kan, &data.tile_indices, positions);
            }
            KanType::Added => {
                let [added] = data.tile_indices[..] else {
                    return Err(HandViolation::InvalidMeld(MeldKind::Kan));
                };
                let tile = self.tile(added)?;
                let seat = self.seat(peer);
                let pon = seat.melds.iter().position(|meld| {
                    meld.kind == MeldKind::Pon
                        && meld.positions.first().map(|p| self.deck[*p as usize]) == Some(tile)
                });
                let Some(pon) = pon else {
                    return Err(HandViolation::NoMatchingPon(tile));
                };
                let mut positions = seat.melds[pon].positions.clone();
                positions.push(added);
                self.require_meld(MeldKind::Kan, &positions)?;
                let seat = self.seat_mut(peer);
                seat.concealed.remove(&added);
                seat.melds[pon] = HeldMeld {
                    kind: MeldKind::Kan,
                    positions,
                };
            }
        }
        Ok(())
    }

    fn win(&mut self, peer: &str, data: &WinData) -> Result<(), HandViolation> {
        let mut expected = self.concealed(peer);
        if data.win_type == WinType::Ron {
            let (Some(target), Some(position)) = (data.target_peer_id.as_ref(), data.win_tile_index)
            else {
                return Err(HandViolation::IncompleteRon);
            };
            self.require_discard(peer, target, position)?;
            self.expect_tile(position, data.win_tile)?;
            expected.push(data.win_tile);
        }
        let mut claimed = data.hand_tiles.clone();
        claimed.sort();
        expected.sort();
        if claimed != expected {
            return Err(HandViolation::HandMismatch);
        }
        if !claimed.contains(&data.win_tile) {
            return Err(HandViolation::WinTileMissing(data.win_tile));
        }
        let melds: Vec<Meld> = self
            .seat(peer)
            .melds
            .iter()
            .map(|meld| Meld {
                kind: meld.kind,
                tiles: meld.positions.iter().map(|p| self.deck[*p as usize]).collect(),
            })
            .collect();
        if !self.judge.is_winning_hand(&claimed, &melds) {
            return Err(HandViolation::NotWinning);
        }
        self.winner = Some(peer.to_string());
        Ok(())
    }

    fn form_meld(&mut self, peer: &str, kind: MeldKind, from_hand: &[u32], positions: Vec<u32>) {
        let seat = self.seat_mut(peer);
        for position in from_hand {
            seat.concealed.remove(position);
        }
        seat.melds.push(HeldMeld { kind, positions });
        self.last_discard = None;
    }

    fn require_meld(&self, kind: MeldKind, positions: &[u32]) -> Result<(), HandViolation> {
        let tiles = positions
            .iter()
            .map(|p| self.tile(*p))
            .collect::<Result<Vec<_>, _>>()?;
        if self.judge.is_valid_meld(kind, &tiles) {
            Ok(())
        } else {
            Err(HandViolation::InvalidMeld(kind))
        }
    }

    fn require_discard(&self, peer: &str, target: &str, position: u32) -> Result<(), HandViolation> {
        if target == peer {
            return Err(HandViolation::OwnDiscard);
        }
        match &self.last_discard {
            Some((by, at)) if by == target && *at == position => Ok(()),
            _ => Err(HandViolation::NotLatestDiscard {
                target: target.to_string(),
                position,
            }),
        }
    }

    fn require_held(&self, peer: &str, positions: &[u32]) -> Result<(), HandViolation> {
        let seat = self.seat(peer);
        let mut seen = BTreeSet::new();
        for position in positions {
            if !seat.concealed.contains(position) || !seen.insert(*position) {
                return Err(HandViolation::NotHeld(*position));
            }
        }
        Ok(())
    }

    fn expect_tile(&self, position: u32, claimed: Tile) -> Result<(), HandViolation> {
        let actual = self.tile(position)?;
        if actual == claimed {
            Ok(())
        } else {
            Err(HandViolation::WrongTile {
                position,
                claimed,
                actual,
            })
        }
    }

    fn tile(&self, position: u32) -> Result<Tile, HandViolation> {
        self.deck
            .get(position as usize)
            .copied()
            .ok_or(HandViolation::NoSuchPosition(position))
    }

    fn tiles_at(&self, positions: &BTreeSet<u32>) -> Vec<Tile> {
        let mut tiles: Vec<Tile> = positions.iter().map(|p| self.deck[*p as usize]).collect();
        tiles.sort();
        tiles
    }

    fn snapshot(&mut self, peer: &str) {
        let tiles = self.concealed(peer);
        if let Some(seat) = self.seats.get_mut(peer) {
            seat.history.snapshots.push(tiles);
        }
    }

    // Callers check the seat exists first.
    fn seat(&self, peer: &str) -> &SeatHand {
        &self.seats[peer]
    }

    fn seat_mut(&mut self, peer: &str) -> &mut SeatHand {
        self.seats.entry(peer.to_string()).or_default()
    }
}
