//! Session Events and Commands
//!
//! Everything that reaches a [`GameSession`](super::GameSession) arrives as a
//! [`SessionEvent`] on its queue: client actions, timer firings and escrow
//! results alike. Side effects the session cannot perform synchronously go
//! back out as [`SessionCommand`]s for the runner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::core::{Address, MatchId};
use crate::escrow::{EscrowError, EscrowInfo};
use crate::game::Color;
use crate::network::protocol::{ClientMessage, ServerMessage};

use super::SessionError;

/// An authenticated player connection.
#[derive(Debug, Clone)]
pub struct PlayerConnection {
    /// Verified wallet address.
    pub address: Address,
    /// Matchmaking rating.
    pub rating: u32,
    /// When this connection authenticated.
    pub connected_at: DateTime<Utc>,
    /// Outbound channel to the client.
    pub sender: mpsc::Sender<ServerMessage>,
}

impl PlayerConnection {
    /// Wrap an outbound channel for `address`.
    pub fn new(address: Address, rating: u32, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            address,
            rating,
            connected_at: Utc::now(),
            sender,
        }
    }

    /// Queue a message without waiting. Returns false if it was dropped.
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(address = %self.address, "Dropped outbound message: {}", e);
                false
            }
        }
    }

    /// The client side of the channel is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Timers a session can schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Active player's clock runs out.
    TurnExpiry,
    /// Roll on behalf of an idle player.
    AutoRoll,
    /// Disconnect grace countdown step.
    DisconnectTick,
    /// Poll escrow deposits.
    DepositPoll,
    /// Give up waiting for deposits.
    DepositTimeout,
}

/// Inbound event for a session's serialized queue.
#[derive(Debug)]
pub enum SessionEvent {
    /// In-game client action.
    Client {
        /// Sender's verified address.
        address: Address,
        /// Where to send errors.
        reply: mpsc::Sender<ServerMessage>,
        /// The action.
        message: ClientMessage,
    },
    /// Take the free seat.
    Join {
        /// Joining player.
        player: PlayerConnection,
        /// Seat assigned, or why not.
        reply: oneshot::Sender<Result<Color, SessionError>>,
    },
    /// Watch the game.
    Spectate {
        /// Spectator's channel.
        sender: mpsc::Sender<ServerMessage>,
    },
    /// A seated player's socket closed.
    Disconnect {
        /// Player address.
        address: Address,
    },
    /// A seated player came back on a new socket.
    Reconnect {
        /// New connection.
        player: PlayerConnection,
    },
    /// A scheduled timer fired.
    Timer {
        /// Which timer.
        kind: TimerKind,
        /// Generation it was scheduled under.
        generation: u64,
    },
    /// Result of `create_escrow`.
    EscrowCreated(Result<(), EscrowError>),
    /// Result of a deposit poll.
    DepositPolled(Result<EscrowInfo, EscrowError>),
    /// Result of a settlement.
    EscrowSettled {
        /// Paid address.
        winner: Address,
        /// Stake multiplier.
        multiplier: u32,
        /// Outcome.
        result: Result<(), EscrowError>,
    },
    /// Result of a cancellation.
    EscrowCancelled(Result<(), EscrowError>),
}

/// Side effect requested by a session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Deliver `Timer { kind, generation }` after `after`.
    ScheduleTimer {
        /// Which timer.
        kind: TimerKind,
        /// Delay.
        after: Duration,
        /// Generation to echo back.
        generation: u64,
    },
    /// Open the escrow.
    CreateEscrow {
        /// Escrow key.
        escrow_id: String,
        /// White's address.
        player_a: Address,
        /// Black's address.
        player_b: Address,
        /// Stake per player.
        wager_amount: u64,
    },
    /// Query deposit progress.
    PollDeposits {
        /// Escrow key.
        escrow_id: String,
    },
    /// Pay out.
    Settle {
        /// Escrow key.
        escrow_id: String,
        /// Paid address.
        winner: Address,
        /// Stake multiplier.
        multiplier: u32,
    },
    /// Refund.
    Cancel {
        /// Escrow key.
        escrow_id: String,
    },
    /// The match continues: start its next game with the same players.
    NextGame {
        /// Owning match.
        match_id: MatchId,
        /// White seat.
        white: PlayerConnection,
        /// Black seat.
        black: PlayerConnection,
        /// Stake carried over.
        wager_amount: u64,
        /// Escrow key carried over, when the stake is held.
        escrow_id: Option<String>,
    },
    /// Session is done; drop it from the registry.
    Evict,
}
