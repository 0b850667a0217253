//! Board Queries and Mutation
//!
//! Pure functions over [`Board`]. Nothing here checks move legality;
//! that lives in `moves.rs`.

use super::types::{Board, Color, BLACK_BAR, WHITE_BAR};

impl Board {
    /// Standard opening position.
    pub fn initial() -> Self {
        let mut points = [0i8; 26];
        points[24] = 2;
        points[13] = 5;
        points[8] = 3;
        points[6] = 5;
        points[1] = -2;
        points[12] = -5;
        points[17] = -3;
        points[19] = -5;
        Self { points, white_off: 0, black_off: 0 }
    }

    /// Empty board, used to build test positions.
    pub fn empty() -> Self {
        Self { points: [0; 26], white_off: 0, black_off: 0 }
    }

    /// Checkers of `color` on a slot.
    #[inline]
    pub fn checker_count(&self, slot: u8, color: Color) -> u8 {
        let v = self.points[slot as usize];
        match color {
            Color::White if v > 0 => v as u8,
            Color::Black if v < 0 => (-v) as u8,
            _ => 0,
        }
    }

    /// Whether `color` is shut out of a point (two or more opposing checkers).
    #[inline]
    pub fn is_blocked(&self, point: u8, color: Color) -> bool {
        if !(1..=24).contains(&point) {
            return false;
        }
        let v = self.points[point as usize];
        match color {
            Color::White => v <= -2,
            Color::Black => v >= 2,
        }
    }

    /// Checkers of `color` waiting on the bar.
    #[inline]
    pub fn bar_count(&self, color: Color) -> u8 {
        self.checker_count(color.bar(), color)
    }

    /// Checkers of `color` already borne off.
    #[inline]
    pub fn borne_off(&self, color: Color) -> u8 {
        match color {
            Color::White => self.white_off,
            Color::Black => self.black_off,
        }
    }

    /// All of `color`'s remaining checkers are in its home board.
    pub fn can_bear_off(&self, color: Color) -> bool {
        if self.bar_count(color) > 0 {
            return false;
        }
        match color {
            Color::White => (7..=24).all(|i| self.points[i] <= 0),
            Color::Black => (1..=18).all(|i| self.points[i] >= 0),
        }
    }

    /// Total checkers of `color` still in play, bar included.
    pub fn checkers_in_play(&self, color: Color) -> u32 {
        (0..26u8).map(|i| self.checker_count(i, color) as u32).sum()
    }

    /// Pip count: total distance `color` must travel to bear everything off.
    pub fn pip_count(&self, color: Color) -> u32 {
        let mut pips = self.bar_count(color) as u32 * 25;
        for point in 1..=24u8 {
            let n = self.checker_count(point, color) as u32;
            let distance = match color {
                Color::White => point as u32,
                Color::Black => 25 - point as u32,
            };
            pips += n * distance;
        }
        pips
    }

    /// Move one checker, hitting a blot on the destination if present.
    ///
    /// The caller guarantees the move is legal.
    pub fn with_move(&self, color: Color, from: u8, to: u8) -> Board {
        let mut next = self.clone();
        match color {
            Color::White => {
                next.points[from as usize] -= 1;
                if to == color.off() {
                    next.white_off += 1;
                    return next;
                }
                if next.points[to as usize] == -1 {
                    next.points[to as usize] = 0;
                    next.points[BLACK_BAR as usize] -= 1;
                }
                next.points[to as usize] += 1;
            }
            Color::Black => {
                next.points[from as usize] += 1;
                if to == color.off() {
                    next.black_off += 1;
                    return next;
                }
                if next.points[to as usize] == 1 {
                    next.points[to as usize] = 0;
                    next.points[WHITE_BAR as usize] += 1;
                }
                next.points[to as usize] -= 1;
            }
        }
        next
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::types::TOTAL_CHECKERS;

    #[test]
    fn test_initial_position_counts() {
        let board = Board::initial();
        assert_eq!(board.checkers_in_play(Color::White), TOTAL_CHECKERS as u32);
        assert_eq!(board.checkers_in_play(Color::Black), TOTAL_CHECKERS as u32);
        assert_eq!(board.pip_count(Color::White), 167);
        assert_eq!(board.pip_count(Color::Black), 167);
    }

    #[test]
    fn test_blocked_points() {
        let board = Board::initial();
        assert!(board.is_blocked(12, Color::White));
        assert!(board.is_blocked(13, Color::Black));
        assert!(!board.is_blocked(7, Color::White));
        assert!(!board.is_blocked(0, Color::White));
    }

    #[test]
    fn test_hit_sends_blot_to_bar() {
        let mut board = Board::empty();
        board.points[10] = 1;
        board.points[7] = -1;
        let next = board.with_move(Color::White, 10, 7);
        assert_eq!(next.points[7], 1);
        assert_eq!(next.bar_count(Color::Black), 1);

        let back = next.with_move(Color::Black, BLACK_BAR, 7);
        assert_eq!(back.points[7], -1);
        assert_eq!(back.bar_count(Color::White), 1);
        assert_eq!(back.bar_count(Color::Black), 0);
    }

    #[test]
    fn test_bear_off_increments_counter() {
        let mut board = Board::empty();
        board.points[3] = 1;
        board.points[22] = -1;
        let next = board.with_move(Color::White, 3, Color::White.off());
        assert_eq!(next.white_off, 1);
        let next = next.with_move(Color::Black, 22, Color::Black.off());
        assert_eq!(next.black_off, 1);
        assert_eq!(next.checkers_in_play(Color::White), 0);
    }

    #[test]
    fn test_can_bear_off() {
        let mut board = Board::empty();
        board.points[6] = 2;
        assert!(board.can_bear_off(Color::White));
        board.points[7] = 1;
        assert!(!board.can_bear_off(Color::White));
        board.points[7] = 0;
        board.points[WHITE_BAR as usize] = 1;
        assert!(!board.can_bear_off(Color::White));
    }
}
