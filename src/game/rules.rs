//! Rules Engine
//!
//! The session layer only talks to the board through [`RulesEngine`]:
//! pure functions with no I/O. [`StandardRules`] is the default
//! implementation for regular backgammon.

use super::moves::legal_first_moves;
use super::types::{Board, Color, GameOutcome, Move, ResultType, TOTAL_CHECKERS};

/// Highest cube value that may still be offered.
pub const MAX_CUBE_VALUE: u32 = 64;

/// Rules engine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RulesError {
    /// A die outside 1..=6.
    #[error("Invalid die value: {0}")]
    InvalidDie(u8),

    /// Move not in the legal set.
    #[error("Illegal move {from}->{to}")]
    IllegalMove {
        /// Source slot.
        from: u8,
        /// Destination slot.
        to: u8,
    },
}

/// Expand a roll into the dice to be played (doubles play four times).
pub fn expand_dice(d1: u8, d2: u8) -> Result<Vec<u8>, RulesError> {
    for d in [d1, d2] {
        if !(1..=6).contains(&d) {
            return Err(RulesError::InvalidDie(d));
        }
    }
    Ok(if d1 == d2 { vec![d1; 4] } else { vec![d1, d2] })
}

/// Whether the cube may be turned from `current` at all.
#[inline]
pub fn can_double(current: u32) -> bool {
    current < MAX_CUBE_VALUE
}

/// Pure backgammon rules as seen by a game session.
pub trait RulesEngine: Send + Sync {
    /// Opening position.
    fn initial_board(&self) -> Board;

    /// Moves `player` may make next with the remaining `dice`.
    fn legal_moves(&self, board: &Board, dice: &[u8], player: Color) -> Vec<Move>;

    /// Board after `mv`. The caller has already validated it.
    fn apply_move(&self, board: &Board, player: Color, mv: &Move) -> Board;

    /// Terminal result, if any side has borne off every checker.
    fn check_win(&self, board: &Board) -> Option<GameOutcome>;
}

/// Standard backgammon rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRules;

impl RulesEngine for StandardRules {
    fn initial_board(&self) -> Board {
        Board::initial()
    }

    fn legal_moves(&self, board: &Board, dice: &[u8], player: Color) -> Vec<Move> {
        legal_first_moves(board, player, dice)
    }

    fn apply_move(&self, board: &Board, player: Color, mv: &Move) -> Board {
        board.with_move(player, mv.from, mv.to)
    }

    fn check_win(&self, board: &Board) -> Option<GameOutcome> {
        let winner = if board.white_off >= TOTAL_CHECKERS {
            Color::White
        } else if board.black_off >= TOTAL_CHECKERS {
            Color::Black
        } else {
            return None;
        };
        let loser = winner.opponent();

        let result_type = if board.borne_off(loser) > 0 {
            ResultType::Normal
        } else if loser_trapped(board, winner) {
            ResultType::Backgammon
        } else {
            ResultType::Gammon
        };

        Some(GameOutcome { winner, result_type })
    }
}

/// Loser has a checker on the bar or inside the winner's home board.
fn loser_trapped(board: &Board, winner: Color) -> bool {
    let loser = winner.opponent();
    if board.bar_count(loser) > 0 {
        return true;
    }
    let home = match winner {
        Color::White => 1..=6u8,
        Color::Black => 19..=24u8,
    };
    home.into_iter().any(|p| board.checker_count(p, loser) > 0)
}

/// Resolve a client `{from, to}` against the legal set, filling in the die.
pub fn find_legal_move(legal: &[Move], from: u8, to: u8) -> Result<Move, RulesError> {
    legal
        .iter()
        .find(|m| m.from == from && m.to == to)
        .copied()
        .ok_or(RulesError::IllegalMove { from, to })
}

/// Remove the die consumed by `mv` from the remaining dice.
pub fn consume_die(dice: &mut Vec<u8>, mv: &Move) {
    if let Some(idx) = dice.iter().position(|&d| d == mv.die) {
        dice.remove(idx);
    }
}
