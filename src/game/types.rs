//! Rules Engine Types
//!
//! Board representation and the small value types exchanged with the
//! session layer. All types serialize to the JSON shapes clients expect.

use serde::{Deserialize, Serialize};

/// Index of white's bar (white enters from here).
pub const WHITE_BAR: u8 = 0;
/// Index of black's bar.
pub const BLACK_BAR: u8 = 25;
/// Destination used for a white checker bearing off.
pub const WHITE_OFF: u8 = 0;
/// Destination used for a black checker bearing off.
pub const BLACK_OFF: u8 = 25;
/// Checkers per side.
pub const TOTAL_CHECKERS: u8 = 15;
/// Number of playable points.
pub const NUM_POINTS: u8 = 24;

/// Side of the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Moves from 24 toward 1, home board 1-6.
    White,
    /// Moves from 1 toward 24, home board 19-24.
    Black,
}

impl Color {
    /// The other side.
    #[inline]
    pub fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Stable index for per-color arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Color::White => 0,
            Color::Black => 1,
        }
    }

    /// Bar slot for this color.
    #[inline]
    pub fn bar(self) -> u8 {
        match self {
            Color::White => WHITE_BAR,
            Color::Black => BLACK_BAR,
        }
    }

    /// Bear-off destination for this color.
    #[inline]
    pub fn off(self) -> u8 {
        match self {
            Color::White => WHITE_OFF,
            Color::Black => BLACK_OFF,
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

/// How decisively a game was won.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// Single game.
    #[default]
    Normal,
    /// Loser bore off no checkers.
    Gammon,
    /// Gammon with a loser checker on the bar or in the winner's home board.
    Backgammon,
}

impl ResultType {
    /// Stake multiplier before the doubling cube.
    #[inline]
    pub fn multiplier(self) -> u32 {
        match self {
            ResultType::Normal => 1,
            ResultType::Gammon => 2,
            ResultType::Backgammon => 3,
        }
    }
}

/// A single checker movement.
///
/// `from`: 0 = white bar, 1-24 = point, 25 = black bar.
/// `to`: 1-24 = point, 0 = white bears off, 25 = black bears off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Move {
    /// Source slot.
    pub from: u8,
    /// Destination slot.
    pub to: u8,
    /// Die value consumed.
    pub die: u8,
}

impl Move {
    /// Create a move.
    pub const fn new(from: u8, to: u8, die: u8) -> Self {
        Self { from, to, die }
    }
}

/// Terminal result reported by the rules engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOutcome {
    /// Winning side.
    pub winner: Color,
    /// Margin of victory.
    pub result_type: ResultType,
}

/// Checker layout.
///
/// 26 slots: index 0 = white bar, 1-24 = points, 25 = black bar.
/// Positive counts are white checkers, negative counts black.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Board {
    /// Signed checker counts per slot.
    pub points: [i8; 26],
    /// White checkers borne off.
    pub white_off: u8,
    /// Black checkers borne off.
    pub black_off: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_opponent() {
        assert_eq!(Color::White.opponent(), Color::Black);
        assert_eq!(Color::Black.opponent(), Color::White);
    }

    #[test]
    fn test_result_multipliers() {
        assert_eq!(ResultType::Normal.multiplier(), 1);
        assert_eq!(ResultType::Gammon.multiplier(), 2);
        assert_eq!(ResultType::Backgammon.multiplier(), 3);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&Color::White).unwrap(), "\"white\"");
        assert_eq!(serde_json::to_string(&ResultType::Backgammon).unwrap(), "\"backgammon\"");
        let r: ResultType = serde_json::from_str("\"gammon\"").unwrap();
        assert_eq!(r, ResultType::Gammon);
    }
}
