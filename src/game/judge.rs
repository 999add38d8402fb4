use serde::{Deserialize, Serialize};

use crate::tiles::{Tile, TILE_KIND_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MeldKind {
    Pon,
    Chi,
    Kan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meld {
    pub kind: MeldKind,
    pub tiles: Vec<Tile>,
}

/// Seam to the rules engine. The fairness layer only asks yes/no questions.
pub trait HandJudge: Send + Sync {
    fn is_valid_meld(&self, kind: MeldKind, tiles: &[Tile]) -> bool;

    /// `concealed` holds every non-melded tile, winning tile included.
    fn is_winning_hand(&self, concealed: &[Tile], melds: &[Meld]) -> bool;
}

/// Shape-only judge: standard meld shapes, four sets and a pair, or seven pairs.
/// Knows nothing about yaku or scoring.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralJudge;

impl HandJudge for StructuralJudge {
    fn is_valid_meld(&self, kind: MeldKind, tiles: &[Tile]) -> bool {
        match kind {
            MeldKind::Pon => tiles.len() == 3 && all_same(tiles),
            MeldKind::Kan => tiles.len() == 4 && all_same(tiles),
            MeldKind::Chi => is_run(tiles),
        }
    }

    fn is_winning_hand(&self, concealed: &[Tile], melds: &[Meld]) -> bool {
        if melds.len() > 4 {
            return false;
        }
        let sets_needed = 4 - melds.len();
        if concealed.len() != sets_needed * 3 + 2 {
            return false;
        }
        let mut counts = [0u8; TILE_KIND_COUNT];
        for tile in concealed {
            counts[tile.index()] += 1;
        }
        if melds.is_empty() && is_seven_pairs(&counts) {
            return true;
        }
        (0..TILE_KIND_COUNT).any(|pair| {
            if counts[pair] < 2 {
                return false;
            }
            let mut rest = counts;
            rest[pair] -= 2;
            decomposes_into_sets(&mut rest)
        })
    }
}

/// Accepts every meld and every hand. For replaying games under house rules the
/// structural judge does not model.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveJudge;

impl HandJudge for PermissiveJudge {
    fn is_valid_meld(&self, _kind: MeldKind, _tiles: &[Tile]) -> bool {
        true
    }

    fn is_winning_hand(&self, _concealed: &[Tile], _melds: &[Meld]) -> bool {
        true
    }
}

fn all_same(tiles: &[Tile]) -> bool {
    tiles.windows(2).all(|pair| pair[0] == pair[1])
}

fn is_run(tiles: &[Tile]) -> bool {
    if tiles.len() != 3 {
        return false;
    }
    let mut sorted = tiles.to_vec();
    sorted.sort();
    let suit = sorted[0].suit();
    let ranks: Option<Vec<u8>> = sorted.iter().map(|tile| tile.rank()).collect();
    match ranks {
        Some(ranks) => {
            sorted.iter().all(|tile| tile.suit() == suit)
                && ranks[1] == ranks[0] + 1
                && ranks[2] == ranks[1] + 1
        }
        None => false,
    }
}

fn is_seven_pairs(counts: &[u8; TILE_KIND_COUNT]) -> bool {
    counts.iter().filter(|count| **count == 2).count() == 7
}

/// Backtracks over the lowest remaining kind: triplet first, then run.
fn decomposes_into_sets(counts: &mut [u8; TILE_KIND_COUNT]) -> bool {
    let Some(first) = counts.iter().position(|count| *count > 0) else {
        return true;
    };
    if counts[first] >= 3 {
        counts[first] -= 3;
        let ok = decomposes_into_sets(counts);
        counts[first] += 3;
        if ok {
            return true;
        }
    }
    let rank_in_suit = first % 9;
    let numbered = first < 27;
    if numbered && rank_in_suit <= 6 && counts[first + 1] > 0 && counts[first + 2] > 0 {
        counts[first] -= 1;
        counts[first + 1] -= 1;
        counts[first + 2] -= 1;
        let ok = decomposes_into_sets(counts);
        counts[first] += 1;
        counts[first + 1] += 1;
        counts[first + 2] += 1;
        return ok;
    }
    false
}
