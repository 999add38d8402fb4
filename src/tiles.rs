use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TILE_KIND_COUNT: usize = 34;

const HONOR_CODES: [&str; 7] = ["E", "S", "W", "N", "C", "F", "P"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Suit {
    Man,
    Pin,
    Sou,
    Honor,
}

impl Suit {
    fn code(self) -> char {
        match self {
            Suit::Man => 'm',
            Suit::Pin => 'p',
            Suit::Sou => 's',
            Suit::Honor => 'z',
        }
    }
}

/// One of the 34 distinct mahjong tile kinds.
///
/// Kinds are ordered man 1-9, pin 1-9, sou 1-9, then the honours
/// east, south, west, north, white (`C`), green (`F`) and red (`P`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileKind(u8);

/// Plaintext value carried inside an encrypted tile.
pub type Tile = TileKind;

impl TileKind {
    pub fn from_index(index: usize) -> Option<Self> {
        (index < TILE_KIND_COUNT).then(|| Self(index as u8))
    }

    pub fn numbered(suit: Suit, rank: u8) -> Option<Self> {
        let base = match suit {
            Suit::Man => 0,
            Suit::Pin => 9,
            Suit::Sou => 18,
            Suit::Honor => return None,
        };
        (1..=9).contains(&rank).then(|| Self(base + rank - 1))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn suit(self) -> Suit {
        match self.0 {
            0..=8 => Suit::Man,
            9..=17 => Suit::Pin,
            18..=26 => Suit::Sou,
            _ => Suit::Honor,
        }
    }

    /// Rank 1-9 for numbered tiles, `None` for honours.
    pub fn rank(self) -> Option<u8> {
        match self.suit() {
            Suit::Honor => None,
            _ => Some(self.0 % 9 + 1),
        }
    }

    pub fn is_honor(self) -> bool {
        self.suit() == Suit::Honor
    }

    pub fn code(self) -> String {
        match self.rank() {
            Some(rank) => format!("{rank}{}", self.suit().code()),
            None => HONOR_CODES[self.0 as usize - 27].to_string(),
        }
    }

    pub fn all() -> impl Iterator<Item = TileKind> {
        (0..TILE_KIND_COUNT as u8).map(TileKind)
    }

    pub fn to_plaintext(self) -> Vec<u8> {
        self.code().into_bytes()
    }

    pub fn from_plaintext(bytes: &[u8]) -> Result<Self, TileParseError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| TileParseError(String::from_utf8_lossy(bytes).into_owned()))?;
        text.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tile code {0:?}")]
pub struct TileParseError(pub String);

impl FromStr for TileKind {
    type Err = TileParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(position) = HONOR_CODES.iter().position(|code| *code == s) {
            return Ok(Self(27 + position as u8));
        }
        let mut chars = s.chars();
        let (Some(rank), Some(suit), None) = (chars.next(), chars.next(), chars.next()) else {
            return Err(TileParseError(s.to_string()));
        };
        let suit = match suit {
            'm' => Suit::Man,
            'p' => Suit::Pin,
            's' => Suit::Sou,
            _ => return Err(TileParseError(s.to_string())),
        };
        rank.to_digit(10)
            .and_then(|rank| TileKind::numbered(suit, rank as u8))
            .ok_or_else(|| TileParseError(s.to_string()))
    }
}

impl fmt::Display for TileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

impl TryFrom<String> for TileKind {
    type Error = TileParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TileKind> for String {
    fn from(value: TileKind) -> Self {
        value.code()
    }
}

/// The complete wall: `copies` of every kind, in kind order.
pub fn full_tile_set(copies: usize) -> Vec<Tile> {
    TileKind::all()
        .flat_map(|kind| std::iter::repeat(kind).take(copies))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindMiscount {
    pub kind: TileKind,
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("deck composition invalid: {total} tiles, expected {expected_total}; {} kinds miscounted", .miscounts.len())]
#[serde(rename_all = "camelCase")]
pub struct CompositionError {
    pub miscounts: Vec<KindMiscount>,
    pub total: usize,
    pub expected_total: usize,
}

/// Checks that `tiles` holds exactly `copies` of each of the 34 kinds.
pub fn check_composition(tiles: &[Tile], copies: usize) -> Result<(), CompositionError> {
    let mut counts: BTreeMap<TileKind, usize> = BTreeMap::new();
    for tile in tiles {
        *counts.entry(*tile).or_default() += 1;
    }

    let miscounts: Vec<KindMiscount> = TileKind::all()
        .filter_map(|kind| {
            let actual = counts.get(&kind).copied().unwrap_or(0);
            (actual != copies).then_some(KindMiscount {
                kind,
                expected: copies,
                actual,
            })
        })
        .collect();

    let expected_total = TILE_KIND_COUNT * copies;
    if miscounts.is_empty() && tiles.len() == expected_total {
        Ok(())
    } else {
        Err(CompositionError {
            miscounts,
            total: tiles.len(),
            expected_total,
        })
    }
}
