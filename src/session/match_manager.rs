//! Match Scoring
//!
//! Tracks multi-game points matches above individual games. Games find
//! their match through a `game_id → match_id` index, so a match can
//! outlive and spawn many sequential games.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::{Address, GameId, MatchId};
use crate::game::{Color, ResultType};

/// Running score of a points match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchState {
    /// Points needed to win.
    pub match_length: u32,
    /// White's score.
    pub white_score: u32,
    /// Black's score.
    pub black_score: u32,
    /// 1-based number of the game being played.
    pub game_number: u32,
    /// The current game is the Crawford game (no doubling).
    pub is_crawford: bool,
    /// The Crawford game already happened.
    pub crawford_game_played: bool,
}

impl MatchState {
    /// Fresh 0-0 match.
    pub fn new(match_length: u32) -> Self {
        Self {
            match_length,
            white_score: 0,
            black_score: 0,
            game_number: 1,
            is_crawford: false,
            crawford_game_played: false,
        }
    }

    /// Score of one side.
    pub fn score(&self, color: Color) -> u32 {
        match color {
            Color::White => self.white_score,
            Color::Black => self.black_score,
        }
    }

    /// Match winner, once either side reaches the match length.
    pub fn winner(&self) -> Option<Color> {
        if self.white_score >= self.match_length {
            Some(Color::White)
        } else if self.black_score >= self.match_length {
            Some(Color::Black)
        } else {
            None
        }
    }

    /// Points each side still needs.
    pub fn points_to_win(&self) -> (u32, u32) {
        (
            self.match_length.saturating_sub(self.white_score),
            self.match_length.saturating_sub(self.black_score),
        )
    }

    fn record(&mut self, winner: Color, points: u32) {
        let was_crawford = self.is_crawford;
        match winner {
            Color::White => self.white_score += points,
            Color::Black => self.black_score += points,
        }
        self.game_number += 1;

        if was_crawford {
            self.is_crawford = false;
            self.crawford_game_played = true;
        } else if !self.crawford_game_played && self.winner().is_none() {
            let match_point = self.match_length.saturating_sub(1);
            self.is_crawford =
                self.white_score == match_point || self.black_score == match_point;
        }
    }
}

/// Lifecycle of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    /// Games still being played.
    Playing,
    /// A side reached the match length.
    Finished,
}

/// A match and the players bound to it.
#[derive(Debug, Clone)]
pub struct ServerMatch {
    /// Match identifier.
    pub id: MatchId,
    /// Score and Crawford state.
    pub state: MatchState,
    /// Game currently being played.
    pub current_game_id: GameId,
    /// White's address.
    pub white: Address,
    /// Black's address.
    pub black: Address,
    /// Stake for the whole match.
    pub wager_amount: u64,
    /// Lifecycle.
    pub status: MatchStatus,
}

/// Result of scoring one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreOutcome {
    /// Owning match.
    pub match_id: MatchId,
    /// Points awarded for this game.
    pub points: u32,
    /// Match has been decided.
    pub match_over: bool,
    /// Winner of the match, when over.
    pub match_winner: Option<Color>,
    /// Score after this game.
    pub state: MatchState,
    /// The next game is the Crawford game.
    pub is_crawford_next: bool,
}

/// Registry of points matches.
#[derive(Debug, Default)]
pub struct MatchManager {
    matches: BTreeMap<MatchId, ServerMatch>,
    game_to_match: BTreeMap<GameId, MatchId>,
}

impl MatchManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new match whose first game is `initial_game_id`.
    pub fn create_match(
        &mut self,
        id: MatchId,
        match_length: u32,
        white: Address,
        black: Address,
        initial_game_id: GameId,
        wager_amount: u64,
    ) -> &ServerMatch {
        self.game_to_match.insert(initial_game_id.clone(), id.clone());
        self.matches.entry(id.clone()).or_insert(ServerMatch {
            id,
            state: MatchState::new(match_length),
            current_game_id: initial_game_id,
            white,
            black,
            wager_amount,
            status: MatchStatus::Playing,
        })
    }

    /// Look up a match.
    pub fn get_match(&self, match_id: &str) -> Option<&ServerMatch> {
        self.matches.get(match_id)
    }

    /// Match owning `game_id`.
    pub fn match_for_game(&self, game_id: &str) -> Option<&ServerMatch> {
        self.game_to_match
            .get(game_id)
            .and_then(|id| self.matches.get(id))
    }

    /// Score a finished game.
    ///
    /// Returns `None` for unknown games and for matches already decided,
    /// so a repeated call never double-counts.
    pub fn score_game(
        &mut self,
        game_id: &str,
        winner: Color,
        result_type: ResultType,
        cube_value: u32,
    ) -> Option<ScoreOutcome> {
        let match_id = self.game_to_match.get(game_id)?;
        let m = self.matches.get_mut(match_id)?;
        if m.status != MatchStatus::Playing {
            return None;
        }

        let points = result_type.multiplier() * cube_value;
        m.state.record(winner, points);

        let match_winner = m.state.winner();
        if match_winner.is_some() {
            m.status = MatchStatus::Finished;
        }

        Some(ScoreOutcome {
            match_id: m.id.clone(),
            points,
            match_over: match_winner.is_some(),
            match_winner,
            state: m.state.clone(),
            is_crawford_next: m.state.is_crawford,
        })
    }

    /// Advance a match to its next game.
    pub fn set_current_game(&mut self, match_id: &str, game_id: GameId) {
        if let Some(m) = self.matches.get_mut(match_id) {
            m.current_game_id = game_id.clone();
            self.game_to_match.insert(game_id, m.id.clone());
        }
    }

    /// Doubling is forbidden only during the Crawford game.
    pub fn is_doubling_allowed(&self, game_id: &str) -> bool {
        self.match_for_game(game_id)
            .map_or(true, |m| !m.state.is_crawford)
    }

    /// Drop a match and all of its game mappings.
    pub fn remove_match(&mut self, match_id: &str) {
        if self.matches.remove(match_id).is_some() {
            self.game_to_match.retain(|_, m| m != match_id);
        }
    }

    /// Number of tracked matches.
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// Whether no matches are tracked.
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_match(length: u32) -> MatchManager {
        let mut mm = MatchManager::new();
        mm.create_match(
            "m1".into(),
            length,
            "xion1white".into(),
            "xion1black".into(),
            "1000".into(),
            0,
        );
        mm
    }

    #[test]
    fn test_points_use_result_and_cube() {
        let mut mm = manager_with_match(7);
        let out = mm.score_game("1000", Color::White, ResultType::Gammon, 2).unwrap();
        assert_eq!(out.points, 4);
        assert_eq!(out.state.white_score, 4);
        assert!(!out.match_over);
    }

    #[test]
    fn test_match_over_and_no_double_scoring() {
        let mut mm = manager_with_match(3);
        let out = mm.score_game("1000", Color::Black, ResultType::Backgammon, 1).unwrap();
        assert!(out.match_over);
        assert_eq!(out.match_winner, Some(Color::Black));

        assert!(mm.score_game("1000", Color::Black, ResultType::Normal, 1).is_none());
        assert_eq!(mm.get_match("m1").unwrap().state.black_score, 3);
    }

    #[test]
    fn test_unknown_game_is_none() {
        let mut mm = MatchManager::new();
        assert!(mm.score_game("nope", Color::White, ResultType::Normal, 1).is_none());
        assert!(mm.is_doubling_allowed("nope"));
    }

    #[test]
    fn test_crawford_exactly_once() {
        let mut mm = manager_with_match(5);
        let mut crawford_games = 0;
        let mut game = 1000u32;

        // White creeps to 4 (match point), then black catches up to 4.
        let winners = [Color::White; 4]
            .into_iter()
            .chain([Color::Black; 4])
            .chain([Color::White]);

        for winner in winners {
            let id = game.to_string();
            if !mm.is_doubling_allowed(&id) {
                crawford_games += 1;
            }
            let out = mm.score_game(&id, winner, ResultType::Normal, 1).unwrap();
            game += 1;
            mm.set_current_game("m1", game.to_string());
            if out.match_over {
                break;
            }
        }

        assert_eq!(crawford_games, 1);
        assert_eq!(mm.get_match("m1").unwrap().status, MatchStatus::Finished);
    }

    #[test]
    fn test_crawford_follows_reaching_match_point() {
        let mut mm = manager_with_match(3);
        let out = mm.score_game("1000", Color::White, ResultType::Gammon, 1).unwrap();
        assert!(out.is_crawford_next);

        mm.set_current_game("m1", "1001".into());
        assert!(!mm.is_doubling_allowed("1001"));

        let out = mm.score_game("1001", Color::Black, ResultType::Normal, 1).unwrap();
        assert!(!out.is_crawford_next);
        mm.set_current_game("m1", "1002".into());
        assert!(mm.is_doubling_allowed("1002"));
    }

    #[test]
    fn test_remove_match_purges_mappings() {
        let mut mm = manager_with_match(3);
        mm.set_current_game("m1", "1001".into());
        mm.remove_match("m1");
        assert!(mm.is_empty());
        assert!(mm.match_for_game("1000").is_none());
        assert!(mm.match_for_game("1001").is_none());
    }
}
