//! Game Sessions
//!
//! Everything between a socket message and the rules engine:
//!
//! ```text
//!   Matchmaker ──► SessionRegistry ──► runner task (one per game)
//!                        │                   │
//!                        │             GameSession ── GameClock
//!                        │                   │      └─ DiceHistory
//!                        └── MatchManager ◄──┘
//! ```
//!
//! A [`GameSession`] is a plain state machine. Its runner feeds it one
//! [`SessionEvent`] at a time and carries out the [`SessionCommand`]s it
//! emits (timers, escrow calls, eviction).

pub mod clock;
pub mod events;
pub mod game;
pub mod match_manager;
pub mod matchmaker;
pub mod registry;
pub mod runner;

use std::time::Duration;

pub use clock::{ClockState, GameClock};
pub use events::{PlayerConnection, SessionCommand, SessionEvent, TimerKind};
pub use game::{GameSession, SessionContext};
pub use match_manager::{MatchManager, MatchState, ScoreOutcome};
pub use matchmaker::{GameFactory, MatchmakingConfig, MatchmakingEntry, Matchmaker, QueueOutcome};
pub use registry::SessionRegistry;
pub use runner::SessionHandle;

use crate::fairness::FairnessError;
use crate::game::RulesError;
use crate::network::protocol::{ErrorCode, ServerMessage};

// =============================================================================
// ERRORS
// =============================================================================

/// Rejected session actions. None of these change session state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No such game.
    #[error("Game not found")]
    GameNotFound,

    /// Sender is not seated in this game.
    #[error("Not a player in this game")]
    NotInGame,

    /// Action requires the active player.
    #[error("Not your turn")]
    NotYourTurn,

    /// Action not valid in the current state.
    #[error("{0}")]
    InvalidState(&'static str),

    /// Seat unavailable.
    #[error("Cannot join: {0}")]
    CannotJoin(&'static str),

    /// Move rejected by the rules engine.
    #[error(transparent)]
    InvalidMove(#[from] RulesError),

    /// Cube may not be turned.
    #[error("Double not allowed: {0}")]
    DoubleNotAllowed(&'static str),

    /// Undo stack empty.
    #[error("Nothing to undo")]
    CannotUndo,

    /// Dice left to play.
    #[error("Cannot end turn with legal moves remaining")]
    CannotEndTurn,

    /// Dice commit problem.
    #[error(transparent)]
    Fairness(#[from] FairnessError),

    /// Escrow could not be reached.
    #[error("Escrow unavailable: {0}")]
    EscrowUnavailable(String),

    /// Game session is gone or unreachable.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::GameNotFound => ErrorCode::GameNotFound,
            SessionError::NotInGame => ErrorCode::NotInGame,
            SessionError::NotYourTurn => ErrorCode::NotYourTurn,
            SessionError::InvalidState(_) => ErrorCode::InvalidState,
            SessionError::CannotJoin(_) => ErrorCode::CannotJoin,
            SessionError::InvalidMove(_) => ErrorCode::InvalidMove,
            SessionError::DoubleNotAllowed(_) => ErrorCode::DoubleNotAllowed,
            SessionError::CannotUndo => ErrorCode::CannotUndo,
            SessionError::CannotEndTurn => ErrorCode::CannotEndTurn,
            SessionError::Fairness(_) => ErrorCode::DiceUnavailable,
            SessionError::EscrowUnavailable(_) => ErrorCode::EscrowUnavailable,
            SessionError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// As an `error` message for the client.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::error(self.code(), self.to_string())
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// What happens to the escrow when a player abandons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbandonmentPolicy {
    /// Pay the connected player.
    #[default]
    Settle,
    /// Refund both players.
    Cancel,
}

/// Per-game timing and policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Main time per player.
    pub time_limit_ms: u64,
    /// Bronstein increment.
    pub increment_ms: u64,
    /// How long a disconnected player has to return.
    pub disconnect_grace: Duration,
    /// Countdown broadcast interval during the grace period.
    pub disconnect_tick: Duration,
    /// Roll for an idle player after this long; `None` disables.
    pub auto_roll: Option<Duration>,
    /// Hold rolls until the active player submits a client seed.
    pub require_client_seed: bool,
    /// Average move time that counts as stalling.
    pub stall_threshold: Duration,
    /// Number of recent moves averaged for stall detection.
    pub stall_window: usize,
    /// Deposit poll interval.
    pub deposit_poll: Duration,
    /// Give up on deposits after this long.
    pub deposit_timeout: Duration,
    /// Play unwagered when the escrow cannot be opened.
    pub allow_unwagered_fallback: bool,
    /// Escrow handling on abandonment.
    pub abandonment_policy: AbandonmentPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            time_limit_ms: clock::DEFAULT_TIME_LIMIT_MS,
            increment_ms: clock::DEFAULT_INCREMENT_MS,
            disconnect_grace: Duration::from_secs(30),
            disconnect_tick: Duration::from_secs(5),
            auto_roll: Some(Duration::from_secs(30)),
            require_client_seed: false,
            stall_threshold: Duration::from_secs(20),
            stall_window: 5,
            deposit_poll: Duration::from_secs(5),
            deposit_timeout: Duration::from_secs(300),
            allow_unwagered_fallback: true,
            abandonment_policy: AbandonmentPolicy::Settle,
        }
    }
}

impl SessionConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let num = |name: &str| -> Option<u64> { std::env::var(name).ok()?.parse().ok() };
        let flag = |name: &str, default: bool| -> bool {
            std::env::var(name)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default)
        };
        let secs = |name: &str, default: Duration| {
            num(name).map(Duration::from_secs).unwrap_or(default)
        };

        let auto_roll = match num("AUTO_ROLL_SECS") {
            Some(0) => None,
            Some(s) => Some(Duration::from_secs(s)),
            None => d.auto_roll,
        };

        let abandonment_policy = match std::env::var("ABANDONMENT_POLICY").as_deref() {
            Ok("cancel") => AbandonmentPolicy::Cancel,
            _ => AbandonmentPolicy::Settle,
        };

        Self {
            time_limit_ms: num("CLOCK_TIME_MS").unwrap_or(d.time_limit_ms),
            increment_ms: num("CLOCK_INCREMENT_MS").unwrap_or(d.increment_ms),
            disconnect_grace: secs("DISCONNECT_GRACE_SECS", d.disconnect_grace),
            disconnect_tick: secs("DISCONNECT_TICK_SECS", d.disconnect_tick),
            auto_roll,
            require_client_seed: flag("REQUIRE_CLIENT_SEED", d.require_client_seed),
            stall_threshold: secs("STALL_THRESHOLD_SECS", d.stall_threshold),
            stall_window: num("STALL_WINDOW")
                .map(|n| n.max(1) as usize)
                .unwrap_or(d.stall_window),
            deposit_poll: secs("DEPOSIT_POLL_SECS", d.deposit_poll),
            deposit_timeout: secs("DEPOSIT_TIMEOUT_SECS", d.deposit_timeout),
            allow_unwagered_fallback: flag("ALLOW_UNWAGERED_FALLBACK", d.allow_unwagered_fallback),
            abandonment_policy,
        }
        .sanitized()
    }

    /// Clamp values that would otherwise re-arm a timer with no delay or
    /// empty the stalling window.
    pub fn sanitized(mut self) -> Self {
        const MIN_INTERVAL: Duration = Duration::from_secs(1);
        self.disconnect_tick = self.disconnect_tick.max(MIN_INTERVAL);
        self.deposit_poll = self.deposit_poll.max(MIN_INTERVAL);
        self.stall_window = self.stall_window.max(1);
        self
    }
}
