//! Game Clock (Bronstein delay)
//!
//! Each side has a bank of main time. At the end of a turn the time spent
//! is deducted and up to `increment` of it is handed back, so a fast move
//! never gains net time.
//!
//! The clock never reads the system time itself; every operation takes
//! `now` so the session (and tests) control the timeline.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::game::Color;

/// Default main time per player.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 3 * 60 * 1000;
/// Default Bronstein increment.
pub const DEFAULT_INCREMENT_MS: u64 = 10 * 1000;

/// Snapshot of both clocks for broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockState {
    /// White's remaining time.
    pub white_time_ms: u64,
    /// Black's remaining time.
    pub black_time_ms: u64,
    /// Side whose time is (or was last) running.
    pub active_player: Color,
    /// Bronstein increment cap.
    pub increment_ms: u64,
    /// Whether no time is currently running.
    pub paused: bool,
}

/// Per-game Bronstein clock.
#[derive(Debug, Clone)]
pub struct GameClock {
    remaining_ms: [u64; 2],
    increment_ms: u64,
    turn_started_at: Option<Instant>,
    active_player: Color,
    paused: bool,
}

impl GameClock {
    /// Both players start with `time_limit_ms`; the clock starts paused.
    pub fn new(time_limit_ms: u64, increment_ms: u64) -> Self {
        Self {
            remaining_ms: [time_limit_ms; 2],
            increment_ms,
            turn_started_at: None,
            active_player: Color::White,
            paused: true,
        }
    }

    /// Start `player`'s turn.
    pub fn start_turn(&mut self, player: Color, now: Instant) {
        self.active_player = player;
        self.turn_started_at = Some(now);
        self.paused = false;
    }

    /// End the active turn, applying the Bronstein increment.
    ///
    /// Returns the increment credited. No-op (returns 0) when paused.
    pub fn end_turn(&mut self, now: Instant) -> u64 {
        if self.paused {
            return 0;
        }
        let spent = self.elapsed_ms(now);
        let increment = self.increment_ms.min(spent);
        let slot = &mut self.remaining_ms[self.active_player.index()];
        *slot = (*slot + increment).saturating_sub(spent);
        self.paused = true;
        increment
    }

    /// Stop the running side's time without crediting an increment.
    pub fn pause(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        let spent = self.elapsed_ms(now);
        let slot = &mut self.remaining_ms[self.active_player.index()];
        *slot = slot.saturating_sub(spent);
        self.paused = true;
    }

    /// Restart the active side's time after a pause.
    pub fn resume(&mut self, now: Instant) {
        self.turn_started_at = Some(now);
        self.paused = false;
    }

    /// Remaining time for `player`, counting live elapsed time if active.
    pub fn remaining_ms(&self, player: Color, now: Instant) -> u64 {
        let base = self.remaining_ms[player.index()];
        if self.paused || self.active_player != player {
            return base;
        }
        base.saturating_sub(self.elapsed_ms(now))
    }

    /// Remaining time as a `Duration`, for scheduling the expiry timer.
    pub fn remaining(&self, player: Color, now: Instant) -> Duration {
        Duration::from_millis(self.remaining_ms(player, now))
    }

    /// `player` has no time left.
    pub fn is_time_expired(&self, player: Color, now: Instant) -> bool {
        self.remaining_ms(player, now) == 0
    }

    /// Side whose time is running (or last ran).
    pub fn active_player(&self) -> Color {
        self.active_player
    }

    /// Whether no time is currently running.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Broadcastable view.
    pub fn state(&self, now: Instant) -> ClockState {
        ClockState {
            white_time_ms: self.remaining_ms(Color::White, now),
            black_time_ms: self.remaining_ms(Color::Black, now),
            active_player: self.active_player,
            increment_ms: self.increment_ms,
            paused: self.paused,
        }
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        self.turn_started_at
            .map(|t| now.saturating_duration_since(t).as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for GameClock {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_LIMIT_MS, DEFAULT_INCREMENT_MS)
    }
}
