//! Matchmaking Queue
//!
//! A single queue with rating-band pairing. A new entry is paired with a
//! uniformly random compatible waiting entry (same wager, same match
//! length, rating within range); otherwise it waits at the back.

use std::time::Instant;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::{Address, GameId};

use super::{PlayerConnection, SessionError};

/// Creates a game for a freshly paired couple.
#[async_trait]
pub trait GameFactory: Send + Sync {
    /// Seat `white` and `black` in a new game and start it.
    async fn create_paired_game(
        &self,
        white: PlayerConnection,
        black: PlayerConnection,
        wager_amount: u64,
        match_length: u32,
    ) -> Result<GameId, SessionError>;
}

/// Matchmaking settings.
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Largest rating difference that may be paired.
    pub rating_range: u32,
    /// Rating assumed when the token carries none.
    pub default_rating: u32,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            rating_range: 200,
            default_rating: 1500,
        }
    }
}

impl MatchmakingConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let num = |name: &str, default: u32| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            rating_range: num("RATING_RANGE", d.rating_range),
            default_rating: num("DEFAULT_RATING", d.default_rating),
        }
    }
}

/// A queued player.
#[derive(Debug, Clone)]
pub struct MatchmakingEntry {
    /// Player and outbound channel.
    pub connection: PlayerConnection,
    /// Stake requested.
    pub wager_amount: u64,
    /// Points to win.
    pub match_length: u32,
    /// When the player queued.
    pub joined_at: Instant,
}

impl MatchmakingEntry {
    /// Queue entry stamped now.
    pub fn new(connection: PlayerConnection, wager_amount: u64, match_length: u32) -> Self {
        Self {
            connection,
            wager_amount,
            match_length,
            joined_at: Instant::now(),
        }
    }

    fn address(&self) -> &str {
        &self.connection.address
    }

    fn compatible_with(&self, other: &MatchmakingEntry, rating_range: u32) -> bool {
        other.address() != self.address()
            && other.wager_amount == self.wager_amount
            && other.match_length == self.match_length
            && other.connection.rating.abs_diff(self.connection.rating) <= rating_range
    }
}

/// Result of joining the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Paired and a game was created.
    Matched {
        /// New game.
        game_id: GameId,
        /// White's address (the entry that just joined).
        white: Address,
        /// Black's address (the entry that was waiting).
        black: Address,
        /// Points to win.
        match_length: u32,
    },
    /// Waiting; 1-based position.
    Queued {
        /// Position in the queue.
        position: usize,
    },
}

/// The matchmaking queue.
pub struct Matchmaker {
    queue: Mutex<Vec<MatchmakingEntry>>,
    config: MatchmakingConfig,
}

impl Matchmaker {
    /// Empty queue.
    pub fn new(config: MatchmakingConfig) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Queue `entry`, pairing it immediately if a compatible player waits.
    ///
    /// The queue stays locked while the game is created so no other join
    /// can claim the same partner.
    pub async fn add_to_queue(
        &self,
        entry: MatchmakingEntry,
        factory: &dyn GameFactory,
    ) -> Result<QueueOutcome, SessionError> {
        let mut queue = self.queue.lock().await;
        queue.retain(|e| e.address() != entry.address());

        let candidates: Vec<usize> = queue
            .iter()
            .enumerate()
            .filter(|(_, c)| entry.compatible_with(c, self.config.rating_range))
            .map(|(i, _)| i)
            .collect();

        let picked = candidates.choose(&mut rand::thread_rng()).copied();
        let Some(idx) = picked else {
            queue.push(entry);
            debug!(size = queue.len(), "Player queued");
            return Ok(QueueOutcome::Queued { position: queue.len() });
        };

        let opponent = queue.remove(idx);
        let match_length = entry.match_length.max(opponent.match_length);
        let white = entry.connection.clone();
        let black = opponent.connection.clone();

        match factory
            .create_paired_game(white, black, entry.wager_amount, match_length)
            .await
        {
            Ok(game_id) => {
                info!(
                    game_id = %game_id,
                    white = %entry.address(),
                    black = %opponent.address(),
                    "Players paired"
                );
                Ok(QueueOutcome::Matched {
                    game_id,
                    white: entry.connection.address,
                    black: opponent.connection.address,
                    match_length,
                })
            }
            Err(e) => {
                queue.insert(0, opponent);
                Err(e)
            }
        }
    }

    /// Remove `address` from the queue. Returns whether it was queued.
    pub async fn remove_from_queue(&self, address: &str) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|e| e.address() != address);
        queue.len() != before
    }

    /// 1-based queue position, 0 when absent.
    pub async fn queue_position(&self, address: &str) -> usize {
        let queue = self.queue.lock().await;
        queue
            .iter()
            .position(|e| e.address() == address)
            .map_or(0, |i| i + 1)
    }

    /// Number of waiting players.
    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Matchmaking settings in use.
    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }
}
