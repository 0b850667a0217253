//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every message is a JSON object tagged by `type`; in-game messages
//! carry the `game_id` they refer to.

use serde::{Deserialize, Serialize};

use crate::core::{Address, GameId};
use crate::fairness::{Dice, DiceReveal};
use crate::game::{Board, Color, Move, ResultType};
use crate::escrow::EscrowStatus;
use crate::session::clock::ClockState;
use crate::session::match_manager::MatchState;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate. Without a token the server answers with a nonce challenge.
    Auth {
        /// Claimed address (only trusted when verification is disabled).
        #[serde(default)]
        address: Option<Address>,
        /// Signed token whose subject is the wallet address.
        #[serde(default)]
        token: Option<String>,
    },

    /// Open a new game and take the white seat.
    CreateGame {
        /// Stake in the escrow denomination (0 = unwagered).
        #[serde(default)]
        wager_amount: u64,
        /// Points to win; 1 plays a single money game.
        #[serde(default = "default_match_length")]
        match_length: u32,
    },

    /// Take the free seat of an existing game.
    JoinGame {
        /// Game to join.
        game_id: GameId,
    },

    /// Enter the matchmaking queue.
    JoinQueue {
        /// Stake in the escrow denomination.
        #[serde(default)]
        wager_amount: u64,
        /// Points to win.
        #[serde(default = "default_match_length")]
        match_length: u32,
    },

    /// Leave the matchmaking queue.
    LeaveQueue,

    /// Move one checker.
    Move {
        /// Game the move belongs to.
        game_id: GameId,
        /// Source slot.
        from: u8,
        /// Destination slot.
        to: u8,
    },

    /// Finish (or confirm) the current turn.
    EndTurn {
        /// Game.
        game_id: GameId,
    },

    /// Ask for this turn's dice.
    RollDice {
        /// Game.
        game_id: GameId,
    },

    /// Contribute entropy to this turn's dice.
    SubmitClientSeed {
        /// Game.
        game_id: GameId,
        /// Arbitrary client-chosen string.
        client_seed: String,
    },

    /// Take back the last move of this turn.
    UndoMove {
        /// Game.
        game_id: GameId,
    },

    /// Offer to resign.
    Resign {
        /// Game.
        game_id: GameId,
        /// Result conceded to the opponent.
        #[serde(default)]
        resign_type: ResultType,
    },

    /// Accept the opponent's resignation offer.
    AcceptResign {
        /// Game.
        game_id: GameId,
    },

    /// Decline the opponent's resignation offer.
    RejectResign {
        /// Game.
        game_id: GameId,
    },

    /// Turn the doubling cube.
    OfferDouble {
        /// Game.
        game_id: GameId,
    },

    /// Take the offered double.
    AcceptDouble {
        /// Game.
        game_id: GameId,
    },

    /// Pass on the offered double (forfeits the game).
    RejectDouble {
        /// Game.
        game_id: GameId,
    },

    /// Watch a game.
    Spectate {
        /// Game.
        game_id: GameId,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp echoed back.
        timestamp: u64,
    },
}

fn default_match_length() -> u32 {
    1
}

impl ClientMessage {
    /// Game referenced by an in-game message.
    pub fn game_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Move { game_id, .. }
            | ClientMessage::EndTurn { game_id }
            | ClientMessage::RollDice { game_id }
            | ClientMessage::SubmitClientSeed { game_id, .. }
            | ClientMessage::UndoMove { game_id }
            | ClientMessage::Resign { game_id, .. }
            | ClientMessage::AcceptResign { game_id }
            | ClientMessage::RejectResign { game_id }
            | ClientMessage::OfferDouble { game_id }
            | ClientMessage::AcceptDouble { game_id }
            | ClientMessage::RejectDouble { game_id }
            | ClientMessage::JoinGame { game_id }
            | ClientMessage::Spectate { game_id } => Some(game_id),
            _ => None,
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Full game snapshot sent with state-changing messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameSnapshot {
    /// Checker layout.
    pub board: Board,
    /// Side to act.
    pub current_player: Color,
    /// Dice rolled this turn, if any.
    pub dice: Option<Dice>,
    /// Dice still to be played.
    pub moves_remaining: Vec<u8>,
    /// 1-based turn counter.
    pub turn_number: u32,
    /// Doubling cube value.
    pub cube_value: u32,
    /// Cube owner; `None` while centered.
    pub cube_owner: Option<Color>,
    /// Side with an open double offer.
    pub double_offered_by: Option<Color>,
    /// White's pip count.
    pub white_pips: u32,
    /// Black's pip count.
    pub black_pips: u32,
    /// Both clocks.
    pub clock: ClockState,
    /// Session lifecycle.
    pub status: GameStatus,
    /// Escrow lifecycle.
    pub escrow_status: EscrowStatus,
    /// Stake.
    pub wager_amount: u64,
    /// Match score when part of a points match.
    pub match_state: Option<MatchState>,
    /// Doubling is disabled (Crawford game).
    pub is_crawford: bool,
    /// Winner once finished.
    pub winner: Option<Color>,
    /// Result once finished.
    pub result_type: Option<ResultType>,
}

/// Game lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Waiting for the second player.
    Waiting,
    /// Waiting for both escrow deposits.
    Depositing,
    /// In progress.
    Playing,
    /// Decided.
    Finished,
    /// Ended by disconnect or deposit failure.
    Abandoned,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication accepted.
    AuthOk {
        /// Verified address.
        address: Address,
    },

    /// Sign this nonce into a token and authenticate again.
    AuthChallenge {
        /// Single-use nonce.
        nonce: String,
    },

    /// Request rejected.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },

    /// Game opened; creator is white.
    GameCreated {
        /// Game.
        game_id: GameId,
        /// Seat.
        color: Color,
    },

    /// Seat taken in an existing game.
    GameJoined {
        /// Game.
        game_id: GameId,
        /// Seat.
        color: Color,
        /// Other player's address.
        opponent: Option<Address>,
    },

    /// Game (re)started; full snapshot.
    GameStart {
        /// Game.
        game_id: GameId,
        /// White's address.
        white: Address,
        /// Black's address.
        black: Address,
        /// Snapshot.
        game_state: GameSnapshot,
    },

    /// Added to the matchmaking queue.
    QueueJoined {
        /// 1-based position.
        position: usize,
    },

    /// Removed from the matchmaking queue.
    QueueLeft,

    /// Commitment for this turn's dice, published before any client seed.
    DiceCommit {
        /// Game.
        game_id: GameId,
        /// SHA-256 of the server seed.
        commit_hash: String,
        /// Turn the commit belongs to.
        turn_number: u32,
    },

    /// Dice revealed with everything needed to verify them.
    DiceRevealed {
        /// Game.
        game_id: GameId,
        /// Rolled dice.
        dice: Dice,
        /// Disclosed server seed.
        server_seed: String,
        /// Client seed mixed in.
        client_seed: String,
        /// Commitment published earlier.
        commit_hash: String,
        /// Turn number.
        turn_number: u32,
    },

    /// Dice applied to the board. Only the roller receives legal moves.
    DiceRolled {
        /// Game.
        game_id: GameId,
        /// Rolled dice.
        dice: Dice,
        /// Roller.
        player: Color,
        /// Snapshot.
        game_state: GameSnapshot,
        /// First moves available to the roller.
        legal_moves: Vec<Move>,
    },

    /// A checker moved.
    MoveMade {
        /// Game.
        game_id: GameId,
        /// The move, die included.
        #[serde(rename = "move")]
        mv: Move,
        /// Mover.
        player: Color,
        /// Snapshot.
        game_state: GameSnapshot,
        /// Next moves for the mover.
        legal_moves: Vec<Move>,
        /// Mover must confirm with `end_turn`.
        needs_confirmation: bool,
    },

    /// Last move taken back.
    MoveUndone {
        /// Game.
        game_id: GameId,
        /// Snapshot.
        game_state: GameSnapshot,
        /// Moves available again.
        legal_moves: Vec<Move>,
    },

    /// Turn passed to the other side.
    TurnEnded {
        /// Game.
        game_id: GameId,
        /// Side to act next.
        next_player: Color,
        /// Snapshot.
        game_state: GameSnapshot,
    },

    /// Game decided.
    GameOver {
        /// Game.
        game_id: GameId,
        /// Winning side.
        winner: Color,
        /// Margin.
        result_type: ResultType,
        /// Cube value at the end.
        cube_value: u32,
        /// Points (or stake multiplier) awarded.
        points: u32,
        /// Final snapshot.
        game_state: GameSnapshot,
        /// Every revealed roll, for audit.
        dice_history: Vec<DiceReveal>,
        /// The match this game belonged to is decided.
        match_over: bool,
    },

    /// The opponent's connection dropped.
    OpponentDisconnected {
        /// Game.
        game_id: GameId,
    },

    /// The opponent is back.
    OpponentReconnected {
        /// Game.
        game_id: GameId,
    },

    /// Grace period started for the opponent.
    OpponentDisconnecting {
        /// Game.
        game_id: GameId,
        /// Length of the grace period.
        grace_seconds: u64,
    },

    /// Grace period countdown tick.
    DisconnectCountdown {
        /// Game.
        game_id: GameId,
        /// Seconds left.
        seconds_remaining: u64,
    },

    /// Game ended without a regular result.
    GameAbandoned {
        /// Game.
        game_id: GameId,
        /// Address awarded the game, if any.
        winner: Option<Address>,
        /// Why the game was abandoned.
        reason: String,
    },

    /// Now watching a game.
    SpectateJoined {
        /// Game.
        game_id: GameId,
        /// Snapshot.
        game_state: GameSnapshot,
    },

    /// Cube turned; awaiting answer.
    DoubleOffered {
        /// Game.
        game_id: GameId,
        /// Offering side.
        player: Color,
        /// Cube value if accepted.
        cube_value: u32,
    },

    /// Double taken.
    DoubleAccepted {
        /// Game.
        game_id: GameId,
        /// New cube value.
        cube_value: u32,
        /// New owner.
        cube_owner: Color,
    },

    /// Double passed; the offering side wins.
    DoubleRejected {
        /// Game.
        game_id: GameId,
        /// Winner.
        winner: Color,
    },

    /// Resignation offered.
    ResignOffered {
        /// Game.
        game_id: GameId,
        /// Resigning side.
        player: Color,
        /// Result conceded.
        resign_type: ResultType,
    },

    /// Resignation accepted.
    ResignAccepted {
        /// Game.
        game_id: GameId,
        /// Winner.
        winner: Color,
        /// Result.
        result_type: ResultType,
    },

    /// Resignation declined; play continues.
    ResignRejected {
        /// Game.
        game_id: GameId,
    },

    /// Escrow opened; both players must deposit.
    EscrowCreated {
        /// Game.
        game_id: GameId,
        /// Required deposit per player.
        wager_amount: u64,
    },

    /// Deposit progress.
    DepositStatus {
        /// Game.
        game_id: GameId,
        /// White deposited.
        player_a_deposited: bool,
        /// Black deposited.
        player_b_deposited: bool,
    },

    /// Both deposits confirmed; play begins.
    EscrowActive {
        /// Game.
        game_id: GameId,
    },

    /// Escrow paid out.
    EscrowSettled {
        /// Game.
        game_id: GameId,
        /// Paid address.
        winner: Address,
        /// Stake multiplier applied.
        multiplier: u32,
    },

    /// Escrow refunded.
    EscrowCancelled {
        /// Game.
        game_id: GameId,
    },

    /// The active player is moving unusually slowly.
    StallingWarning {
        /// Game.
        game_id: GameId,
        /// Notice text.
        message: String,
    },

    /// Pong response.
    Pong {
        /// Client timestamp echoed.
        timestamp: u64,
        /// Server timestamp (ms since epoch).
        server_time: u64,
    },

    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Action requires the active player.
    NotYourTurn,
    /// Action not valid in the current state.
    InvalidState,
    /// Sender is not seated in the game.
    NotInGame,
    /// Authenticate first.
    NotAuthenticated,
    /// Token rejected.
    AuthFailed,
    /// Malformed message.
    InvalidMessage,
    /// Move not in the legal set.
    InvalidMove,
    /// Cube may not be turned now.
    DoubleNotAllowed,
    /// Nothing to undo.
    CannotUndo,
    /// Dice left to play.
    CannotEndTurn,
    /// Dice commit missing or already revealed.
    DiceUnavailable,
    /// Escrow call failed.
    EscrowUnavailable,
    /// Settlement failed.
    SettlementFailed,
    /// No such game.
    GameNotFound,
    /// Game full or already joined.
    CannotJoin,
    /// Server at capacity.
    ServerOverloaded,
    /// Unexpected failure.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Shorthand for an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error { code, message: message.into() }
    }
}

// =============================================================================
// TESTS
// =============================================================================
