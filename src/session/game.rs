//! Game Session State Machine
//!
//! One `GameSession` per game. It owns the board, clock, dice ledger and
//! cube, and is the only thing that mutates them. The session never
//! awaits: every handler takes `now`, updates state, pushes outbound
//! messages onto the players' channels and records [`SessionCommand`]s
//! for its runner to carry out.
//!
//! ```text
//! waiting ──► depositing ──► playing ──► finished
//!    │            │             │
//!    └────────────┴─────────────┴──────► abandoned
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::ids::generate_match_id;
use crate::core::{random_seed_hex, Address, GameId, MatchId};
use crate::escrow::{settlement_multiplier, EscrowError, EscrowInfo, EscrowStatus};
use crate::fairness::{Dice, DiceHistory};
use crate::game::rules::{can_double, consume_die, find_legal_move};
use crate::game::{expand_dice, format_move, Board, Color, Move, ResultType, RulesEngine};
use crate::network::protocol::{
    ClientMessage, ErrorCode, GameSnapshot, GameStatus, ServerMessage,
};

use super::{
    AbandonmentPolicy, GameClock, MatchManager, PlayerConnection, SessionCommand, SessionConfig,
    SessionError, SessionEvent, TimerKind,
};

/// Shared collaborators every session needs.
#[derive(Clone)]
pub struct SessionContext {
    /// Timing and policy.
    pub config: Arc<SessionConfig>,
    /// Rules engine.
    pub rules: Arc<dyn RulesEngine>,
    /// Match scorekeeper shared by all sessions.
    pub matches: Arc<Mutex<MatchManager>>,
}

impl SessionContext {
    /// Bundle the collaborators.
    pub fn new(
        config: SessionConfig,
        rules: Arc<dyn RulesEngine>,
        matches: Arc<Mutex<MatchManager>>,
    ) -> Self {
        Self {
            config: Arc::new(config.sanitized()),
            rules,
            matches,
        }
    }
}

#[derive(Debug)]
struct Seat {
    conn: PlayerConnection,
    connected: bool,
}

#[derive(Debug, Clone)]
struct TurnSnapshot {
    board: Board,
    moves_remaining: Vec<u8>,
}

/// A single game of backgammon between two seated players.
pub struct GameSession {
    id: GameId,
    ctx: SessionContext,
    status: GameStatus,

    seats: [Option<Seat>; 2],
    spectators: Vec<mpsc::Sender<ServerMessage>>,

    board: Board,
    current_player: Color,
    turn_number: u32,
    dice: Option<Dice>,
    moves_remaining: Vec<u8>,
    turn_stack: Vec<TurnSnapshot>,
    pending_confirmation: bool,

    dice_history: DiceHistory,
    client_seed: Option<String>,
    awaiting_client_seed: bool,

    clock: GameClock,

    cube_value: u32,
    cube_owner: Option<Color>,
    double_offered_by: Option<Color>,
    pending_resignation: Option<(Color, ResultType)>,

    wager_amount: u64,
    match_length: u32,
    match_id: Option<MatchId>,
    escrow_id: Option<String>,
    escrow_status: EscrowStatus,
    escrow_creating: bool,

    disconnected: Option<(Color, Instant)>,

    move_times: [VecDeque<Duration>; 2],
    last_action_at: Option<Instant>,
    stalling_warned: [bool; 2],

    winner: Option<Color>,
    result_type: Option<ResultType>,

    timers: BTreeMap<TimerKind, u64>,
    commands: Vec<SessionCommand>,
}

impl GameSession {
    /// New game awaiting players.
    pub fn new(id: GameId, ctx: SessionContext, wager_amount: u64, match_length: u32) -> Self {
        let board = ctx.rules.initial_board();
        let clock = GameClock::new(ctx.config.time_limit_ms, ctx.config.increment_ms);
        Self {
            id,
            ctx,
            status: GameStatus::Waiting,
            seats: [None, None],
            spectators: Vec::new(),
            board,
            current_player: Color::White,
            turn_number: 0,
            dice: None,
            moves_remaining: Vec::new(),
            turn_stack: Vec::new(),
            pending_confirmation: false,
            dice_history: DiceHistory::new(),
            client_seed: None,
            awaiting_client_seed: false,
            clock,
            cube_value: 1,
            cube_owner: None,
            double_offered_by: None,
            pending_resignation: None,
            wager_amount,
            match_length: match_length.max(1),
            match_id: None,
            escrow_id: None,
            escrow_status: EscrowStatus::None,
            escrow_creating: false,
            disconnected: None,
            move_times: [VecDeque::new(), VecDeque::new()],
            last_action_at: None,
            stalling_warned: [false; 2],
            winner: None,
            result_type: None,
            timers: BTreeMap::new(),
            commands: Vec::new(),
        }
    }

    /// Next game of a running match. Both seats are filled and any escrow
    /// is already funded; call [`start_continuation`](Self::start_continuation)
    /// to begin play.
    pub fn next_in_match(
        id: GameId,
        ctx: SessionContext,
        match_id: MatchId,
        white: PlayerConnection,
        black: PlayerConnection,
        wager_amount: u64,
        escrow_id: Option<String>,
    ) -> Self {
        let match_length = lock(&ctx.matches)
            .get_match(&match_id)
            .map_or(1, |m| m.state.match_length);
        let mut session = Self::new(id, ctx, wager_amount, match_length);
        session.seats = [
            Some(Seat { conn: white, connected: true }),
            Some(Seat { conn: black, connected: true }),
        ];
        session.match_id = Some(match_id);
        if escrow_id.is_some() {
            session.escrow_status = EscrowStatus::Active;
        }
        session.escrow_id = escrow_id;
        session
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Game id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lifecycle state.
    pub fn status(&self) -> GameStatus {
        self.status
    }

    /// Owning match, if any.
    pub fn match_id(&self) -> Option<&str> {
        self.match_id.as_deref()
    }

    /// Escrow lifecycle.
    pub fn escrow_status(&self) -> EscrowStatus {
        self.escrow_status
    }

    /// Addresses of the seated players.
    pub fn player_addresses(&self) -> Vec<Address> {
        self.seats
            .iter()
            .flatten()
            .map(|s| s.conn.address.clone())
            .collect()
    }

    /// Seat of `address`.
    pub fn color_of(&self, address: &str) -> Option<Color> {
        [Color::White, Color::Black]
            .into_iter()
            .find(|c| self.seat(*c).map_or(false, |s| s.conn.address == address))
    }

    /// Game has ended one way or another.
    pub fn is_over(&self) -> bool {
        matches!(self.status, GameStatus::Finished | GameStatus::Abandoned)
    }

    /// Drain side effects recorded since the last call.
    pub fn take_commands(&mut self) -> Vec<SessionCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Full state for clients.
    pub fn snapshot(&self, now: Instant) -> GameSnapshot {
        let match_state = self.match_id.as_ref().and_then(|_| {
            lock(&self.ctx.matches)
                .match_for_game(&self.id)
                .map(|m| m.state.clone())
        });
        let is_crawford = match_state.as_ref().map_or(false, |m| m.is_crawford);

        GameSnapshot {
            board: self.board.clone(),
            current_player: self.current_player,
            dice: self.dice,
            moves_remaining: self.moves_remaining.clone(),
            turn_number: self.turn_number,
            cube_value: self.cube_value,
            cube_owner: self.cube_owner,
            double_offered_by: self.double_offered_by,
            white_pips: self.board.pip_count(Color::White),
            black_pips: self.board.pip_count(Color::Black),
            clock: self.clock.state(now),
            status: self.status,
            escrow_status: self.escrow_status,
            wager_amount: self.wager_amount,
            match_state,
            is_crawford,
            winner: self.winner,
            result_type: self.result_type,
        }
    }

    // =========================================================================
    // Event dispatch
    // =========================================================================

    /// Apply one queued event.
    pub fn handle_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Client { address, reply, message } => {
                if let Err(e) = self.handle_client(&address, message, now) {
                    debug!(game_id = %self.id, %address, error = %e, "Rejected client action");
                    let _ = reply.try_send(e.to_message());
                }
            }
            SessionEvent::Join { player, reply } => {
                let result = self.join(player, now);
                let _ = reply.send(result);
            }
            SessionEvent::Spectate { sender } => self.spectate(sender, now),
            SessionEvent::Disconnect { address } => self.handle_disconnect(&address, now),
            SessionEvent::Reconnect { player } => self.handle_reconnect(player, now),
            SessionEvent::Timer { kind, generation } => self.handle_timer(kind, generation, now),
            SessionEvent::EscrowCreated(result) => self.on_escrow_created(result, now),
            SessionEvent::DepositPolled(result) => self.on_deposit_polled(result, now),
            SessionEvent::EscrowSettled { winner, multiplier, result } => {
                self.on_escrow_settled(winner, multiplier, result)
            }
            SessionEvent::EscrowCancelled(result) => self.on_escrow_cancelled(result),
        }
    }

    /// Apply an in-game action from `address`.
    pub fn handle_client(
        &mut self,
        address: &str,
        message: ClientMessage,
        now: Instant,
    ) -> Result<(), SessionError> {
        let color = self.color_of(address).ok_or(SessionError::NotInGame)?;
        self.enforce_clock(now)?;
        match message {
            ClientMessage::RollDice { .. } => self.roll_dice(color, now),
            ClientMessage::SubmitClientSeed { client_seed, .. } => {
                self.submit_client_seed(color, client_seed, now)
            }
            ClientMessage::Move { from, to, .. } => self.make_move(color, from, to, now),
            ClientMessage::UndoMove { .. } => self.undo_move(color, now),
            ClientMessage::EndTurn { .. } => self.end_turn(color, now),
            ClientMessage::OfferDouble { .. } => self.offer_double(color, now),
            ClientMessage::AcceptDouble { .. } => self.accept_double(color, now),
            ClientMessage::RejectDouble { .. } => self.reject_double(color, now),
            ClientMessage::Resign { resign_type, .. } => self.resign(color, resign_type),
            ClientMessage::AcceptResign { .. } => self.accept_resign(color, now),
            ClientMessage::RejectResign { .. } => self.reject_resign(color),
            _ => Err(SessionError::InvalidState("Not an in-game action")),
        }
    }

    // =========================================================================
    // Seating
    // =========================================================================

    /// Seat a player: white first, then black. Filling the second seat
    /// starts deposits (wagered) or play.
    pub fn join(&mut self, player: PlayerConnection, now: Instant) -> Result<Color, SessionError> {
        if self.status != GameStatus::Waiting {
            return Err(SessionError::CannotJoin("game already started"));
        }
        if self.color_of(&player.address).is_some() {
            return Err(SessionError::CannotJoin("already seated"));
        }

        if self.seats[Color::White.index()].is_none() {
            info!(game_id = %self.id, address = %player.address, "White seated");
            self.seats[Color::White.index()] = Some(Seat { conn: player, connected: true });
            return Ok(Color::White);
        }

        let opponent = self.seat(Color::White).map(|s| s.conn.address.clone());
        player.send(ServerMessage::GameJoined {
            game_id: self.id.clone(),
            color: Color::Black,
            opponent,
        });
        info!(game_id = %self.id, address = %player.address, "Black seated");
        self.seats[Color::Black.index()] = Some(Seat { conn: player, connected: true });
        self.on_seats_filled(now);
        Ok(Color::Black)
    }

    /// Add a read-only observer.
    pub fn spectate(&mut self, sender: mpsc::Sender<ServerMessage>, now: Instant) {
        self.spectators.retain(|s| !s.is_closed());
        let _ = sender.try_send(ServerMessage::SpectateJoined {
            game_id: self.id.clone(),
            game_state: self.snapshot(now),
        });
        self.spectators.push(sender);
    }

    /// Begin a continuation game created by [`next_in_match`](Self::next_in_match).
    pub fn start_continuation(&mut self, now: Instant) {
        self.begin_play(now);
        for color in [Color::White, Color::Black] {
            let gone = self.seat(color).map(|s| s.conn.is_closed());
            if let (Some(true), Some(address)) = (gone, self.address_of(color)) {
                self.handle_disconnect(&address, now);
            }
        }
    }

    fn on_seats_filled(&mut self, now: Instant) {
        let (Some(white), Some(black)) = (self.address_of(Color::White), self.address_of(Color::Black))
        else {
            return;
        };

        if self.match_length > 1 && self.match_id.is_none() {
            let match_id = generate_match_id();
            lock(&self.ctx.matches).create_match(
                match_id.clone(),
                self.match_length,
                white.clone(),
                black.clone(),
                self.id.clone(),
                self.wager_amount,
            );
            info!(game_id = %self.id, match_id = %match_id, length = self.match_length, "Match created");
            self.match_id = Some(match_id);
        }

        if self.wager_amount > 0 && self.escrow_id.is_none() {
            let escrow_id = self.match_id.clone().unwrap_or_else(|| self.id.clone());
            self.status = GameStatus::Depositing;
            self.escrow_id = Some(escrow_id.clone());
            self.escrow_creating = true;
            self.commands.push(SessionCommand::CreateEscrow {
                escrow_id,
                player_a: white,
                player_b: black,
                wager_amount: self.wager_amount,
            });
            if let Some(msg) = self.game_start_message(now) {
                self.broadcast(msg);
            }
        } else {
            self.begin_play(now);
        }
    }

    fn begin_play(&mut self, now: Instant) {
        self.status = GameStatus::Playing;
        self.start_turn(Color::White, now);
        if let Some(msg) = self.game_start_message(now) {
            self.broadcast(msg);
        }
        self.announce_commit();
        info!(game_id = %self.id, wager = self.wager_amount, escrow = ?self.escrow_status, "Game started");
    }

    // =========================================================================
    // Turns and dice
    // =========================================================================

    fn start_turn(&mut self, player: Color, now: Instant) {
        self.current_player = player;
        self.turn_number += 1;
        self.dice = None;
        self.moves_remaining.clear();
        self.turn_stack.clear();
        self.pending_confirmation = false;
        self.client_seed = None;
        self.awaiting_client_seed = false;
        self.last_action_at = Some(now);

        if let Err(e) = self.dice_history.create_turn_commit(self.turn_number) {
            error!(game_id = %self.id, turn = self.turn_number, error = %e, "Dice commit failed");
        }

        self.clock.start_turn(player, now);
        self.arm_clock(now);
    }

    fn announce_commit(&self) {
        if let Some(hash) = self.dice_history.commit_hash(self.turn_number) {
            self.broadcast(ServerMessage::DiceCommit {
                game_id: self.id.clone(),
                commit_hash: hash.to_string(),
                turn_number: self.turn_number,
            });
        }
    }

    fn roll_dice(&mut self, color: Color, now: Instant) -> Result<(), SessionError> {
        self.require_turn(color)?;
        if self.dice.is_some() {
            return Err(SessionError::InvalidState("Dice already rolled"));
        }
        if self.double_offered_by.is_some() {
            return Err(SessionError::InvalidState("A double is awaiting an answer"));
        }

        match self.client_seed.clone() {
            Some(seed) => self.reveal_and_apply(seed, now),
            None if self.ctx.config.require_client_seed => {
                self.awaiting_client_seed = true;
                debug!(game_id = %self.id, turn = self.turn_number, "Roll waiting for client seed");
                Ok(())
            }
            None => self.reveal_and_apply(random_seed_hex(), now),
        }
    }

    fn submit_client_seed(
        &mut self,
        color: Color,
        client_seed: String,
        now: Instant,
    ) -> Result<(), SessionError> {
        self.require_turn(color)?;
        if self.dice.is_some() {
            return Err(SessionError::InvalidState("Dice already rolled"));
        }
        self.client_seed = Some(client_seed.clone());
        if self.awaiting_client_seed {
            self.reveal_and_apply(client_seed, now)?;
        }
        Ok(())
    }

    fn reveal_and_apply(&mut self, client_seed: String, now: Instant) -> Result<(), SessionError> {
        let reveal = self.dice_history.reveal_dice(self.turn_number, &client_seed)?;
        let [d1, d2] = reveal.dice;
        self.moves_remaining = expand_dice(d1, d2)?;
        self.dice = Some(reveal.dice);
        self.awaiting_client_seed = false;
        self.last_action_at = Some(now);
        self.cancel_timer(TimerKind::AutoRoll);

        let player = self.current_player;
        info!(game_id = %self.id, turn = self.turn_number, %player, dice = ?reveal.dice, "Dice rolled");

        self.broadcast(ServerMessage::DiceRevealed {
            game_id: self.id.clone(),
            dice: reveal.dice,
            server_seed: reveal.server_seed,
            client_seed: reveal.client_seed,
            commit_hash: reveal.commit_hash,
            turn_number: reveal.turn_number,
        });

        let legal = self.legal_moves();
        let snapshot = self.snapshot(now);
        let game_id = self.id.clone();
        self.broadcast_with(|to| ServerMessage::DiceRolled {
            game_id: game_id.clone(),
            dice: reveal.dice,
            player,
            game_state: snapshot.clone(),
            legal_moves: if to == Some(player) { legal.clone() } else { Vec::new() },
        });

        if legal.is_empty() {
            debug!(game_id = %self.id, %player, "No legal moves, turn passes");
            self.complete_turn(now);
        }
        Ok(())
    }

    fn make_move(&mut self, color: Color, from: u8, to: u8, now: Instant) -> Result<(), SessionError> {
        self.require_turn(color)?;
        if self.dice.is_none() {
            return Err(SessionError::InvalidState("Roll the dice first"));
        }

        let mv = find_legal_move(&self.legal_moves(), from, to)?;
        self.turn_stack.push(TurnSnapshot {
            board: self.board.clone(),
            moves_remaining: self.moves_remaining.clone(),
        });
        self.board = self.ctx.rules.apply_move(&self.board, color, &mv);
        consume_die(&mut self.moves_remaining, &mv);
        self.record_move_time(color, now);
        debug!(game_id = %self.id, player = %color, mv = %format_move(&mv, color), "Move");

        if let Some(outcome) = self.ctx.rules.check_win(&self.board) {
            self.broadcast_move(mv, color, Vec::new(), false, now);
            self.finish_game(outcome.winner, outcome.result_type, "bear_off", now);
            return Ok(());
        }

        let next = self.legal_moves();
        self.pending_confirmation = next.is_empty();
        let needs_confirmation = self.pending_confirmation;
        self.broadcast_move(mv, color, next, needs_confirmation, now);
        self.check_stalling(color);
        Ok(())
    }

    fn broadcast_move(
        &self,
        mv: Move,
        player: Color,
        legal: Vec<Move>,
        needs_confirmation: bool,
        now: Instant,
    ) {
        let snapshot = self.snapshot(now);
        let game_id = self.id.clone();
        self.broadcast_with(|to| {
            let mover = to == Some(player);
            ServerMessage::MoveMade {
                game_id: game_id.clone(),
                mv,
                player,
                game_state: snapshot.clone(),
                legal_moves: if mover { legal.clone() } else { Vec::new() },
                needs_confirmation: mover && needs_confirmation,
            }
        });
    }

    fn undo_move(&mut self, color: Color, now: Instant) -> Result<(), SessionError> {
        self.require_turn(color)?;
        let prev = self.turn_stack.pop().ok_or(SessionError::CannotUndo)?;
        self.board = prev.board;
        self.moves_remaining = prev.moves_remaining;
        self.pending_confirmation = false;

        let legal = self.legal_moves();
        let snapshot = self.snapshot(now);
        let game_id = self.id.clone();
        self.broadcast_with(|to| ServerMessage::MoveUndone {
            game_id: game_id.clone(),
            game_state: snapshot.clone(),
            legal_moves: if to == Some(color) { legal.clone() } else { Vec::new() },
        });
        Ok(())
    }

    fn end_turn(&mut self, color: Color, now: Instant) -> Result<(), SessionError> {
        self.require_turn(color)?;
        if self.dice.is_none() {
            return Err(SessionError::CannotEndTurn);
        }
        if !self.pending_confirmation && !self.legal_moves().is_empty() {
            return Err(SessionError::CannotEndTurn);
        }
        self.complete_turn(now);
        Ok(())
    }

    fn complete_turn(&mut self, now: Instant) {
        let finished = self.current_player;
        self.clock.end_turn(now);
        self.cancel_timer(TimerKind::TurnExpiry);
        self.cancel_timer(TimerKind::AutoRoll);

        self.start_turn(finished.opponent(), now);
        self.broadcast(ServerMessage::TurnEnded {
            game_id: self.id.clone(),
            next_player: self.current_player,
            game_state: self.snapshot(now),
        });
        self.announce_commit();
    }

    fn legal_moves(&self) -> Vec<Move> {
        if self.moves_remaining.is_empty() {
            return Vec::new();
        }
        self.ctx
            .rules
            .legal_moves(&self.board, &self.moves_remaining, self.current_player)
    }

    // =========================================================================
    // Doubling cube
    // =========================================================================

    fn offer_double(&mut self, color: Color, now: Instant) -> Result<(), SessionError> {
        self.require_turn(color)?;
        if self.dice.is_some() {
            return Err(SessionError::DoubleNotAllowed("double before rolling"));
        }
        if self.double_offered_by.is_some() {
            return Err(SessionError::DoubleNotAllowed("a double is already pending"));
        }
        if self.cube_owner.map_or(false, |owner| owner != color) {
            return Err(SessionError::DoubleNotAllowed("opponent owns the cube"));
        }
        if !can_double(self.cube_value) {
            return Err(SessionError::DoubleNotAllowed("cube at maximum"));
        }
        if !lock(&self.ctx.matches).is_doubling_allowed(&self.id) {
            return Err(SessionError::DoubleNotAllowed("Crawford game"));
        }

        self.double_offered_by = Some(color);
        self.run_clock_for(color.opponent(), now);
        info!(game_id = %self.id, player = %color, cube = self.cube_value * 2, "Double offered");
        self.broadcast(ServerMessage::DoubleOffered {
            game_id: self.id.clone(),
            player: color,
            cube_value: self.cube_value * 2,
        });
        Ok(())
    }

    fn take_double_offer(&mut self, color: Color) -> Result<Color, SessionError> {
        self.require_playing()?;
        let offerer = self
            .double_offered_by
            .ok_or(SessionError::InvalidState("No double offered"))?;
        if color != offerer.opponent() {
            return Err(SessionError::NotYourTurn);
        }
        self.double_offered_by = None;
        Ok(offerer)
    }

    fn accept_double(&mut self, color: Color, now: Instant) -> Result<(), SessionError> {
        let offerer = self.take_double_offer(color)?;
        self.cube_value *= 2;
        self.cube_owner = Some(color);
        self.run_clock_for(offerer, now);
        info!(game_id = %self.id, cube = self.cube_value, owner = %color, "Double accepted");
        self.broadcast(ServerMessage::DoubleAccepted {
            game_id: self.id.clone(),
            cube_value: self.cube_value,
            cube_owner: color,
        });
        Ok(())
    }

    fn reject_double(&mut self, color: Color, now: Instant) -> Result<(), SessionError> {
        let offerer = self.take_double_offer(color)?;
        info!(game_id = %self.id, winner = %offerer, "Double rejected");
        self.broadcast(ServerMessage::DoubleRejected {
            game_id: self.id.clone(),
            winner: offerer,
        });
        self.finish_game(offerer, ResultType::Normal, "double_rejected", now);
        Ok(())
    }

    // =========================================================================
    // Resignation
    // =========================================================================

    fn resign(&mut self, color: Color, resign_type: ResultType) -> Result<(), SessionError> {
        self.require_playing()?;
        if self.pending_resignation.is_some() {
            return Err(SessionError::InvalidState("A resignation is already pending"));
        }
        self.pending_resignation = Some((color, resign_type));
        self.broadcast(ServerMessage::ResignOffered {
            game_id: self.id.clone(),
            player: color,
            resign_type,
        });
        Ok(())
    }

    fn take_resignation(&mut self, color: Color) -> Result<(Color, ResultType), SessionError> {
        self.require_playing()?;
        let (resigner, resign_type) = self
            .pending_resignation
            .ok_or(SessionError::InvalidState("No resignation offered"))?;
        if color == resigner {
            return Err(SessionError::InvalidState("Cannot answer your own resignation"));
        }
        self.pending_resignation = None;
        Ok((resigner, resign_type))
    }

    fn accept_resign(&mut self, color: Color, now: Instant) -> Result<(), SessionError> {
        let (resigner, result_type) = self.take_resignation(color)?;
        let winner = resigner.opponent();
        self.broadcast(ServerMessage::ResignAccepted {
            game_id: self.id.clone(),
            winner,
            result_type,
        });
        self.finish_game(winner, result_type, "resignation", now);
        Ok(())
    }

    fn reject_resign(&mut self, color: Color) -> Result<(), SessionError> {
        self.take_resignation(color)?;
        self.broadcast(ServerMessage::ResignRejected { game_id: self.id.clone() });
        Ok(())
    }

    // =========================================================================
    // Clock
    // =========================================================================

    /// Move the running clock to `color` (used while a double awaits an answer).
    fn run_clock_for(&mut self, color: Color, now: Instant) {
        self.clock.pause(now);
        self.clock.start_turn(color, now);
        self.arm_clock(now);
    }

    /// (Re)schedule turn timers for whoever's clock is running. While a
    /// player is disconnected the clock stays paused and nothing is armed.
    fn arm_clock(&mut self, now: Instant) {
        if self.disconnected.is_some() {
            self.clock.pause(now);
            self.cancel_timer(TimerKind::TurnExpiry);
            self.cancel_timer(TimerKind::AutoRoll);
            return;
        }

        let active = self.clock.active_player();
        self.schedule(TimerKind::TurnExpiry, self.clock.remaining(active, now));

        match self.ctx.config.auto_roll {
            Some(after) if self.dice.is_none() && self.double_offered_by.is_none() => {
                self.schedule(TimerKind::AutoRoll, after)
            }
            _ => self.cancel_timer(TimerKind::AutoRoll),
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Handle a fired timer. Timers superseded since scheduling are ignored.
    pub fn handle_timer(&mut self, kind: TimerKind, generation: u64, now: Instant) {
        if self.timers.get(&kind) != Some(&generation) {
            debug!(game_id = %self.id, ?kind, generation, "Stale timer ignored");
            return;
        }

        match kind {
            TimerKind::TurnExpiry => {
                if self.status != GameStatus::Playing || self.clock.is_paused() {
                    return;
                }
                let active = self.clock.active_player();
                if self.clock.is_time_expired(active, now) {
                    info!(game_id = %self.id, player = %active, "Time expired");
                    self.finish_game(active.opponent(), ResultType::Normal, "time_expired", now);
                } else {
                    self.schedule(TimerKind::TurnExpiry, self.clock.remaining(active, now));
                }
            }
            TimerKind::AutoRoll => {
                let idle = self.status == GameStatus::Playing
                    && self.dice.is_none()
                    && self.double_offered_by.is_none()
                    && self.disconnected.is_none();
                if idle {
                    let seed = self.client_seed.clone().unwrap_or_else(random_seed_hex);
                    debug!(game_id = %self.id, player = %self.current_player, "Auto-rolling");
                    if let Err(e) = self.reveal_and_apply(seed, now) {
                        error!(game_id = %self.id, error = %e, "Auto-roll failed");
                    }
                }
            }
            TimerKind::DisconnectTick => self.disconnect_tick(now),
            TimerKind::DepositPoll => {
                if let (GameStatus::Depositing, Some(escrow_id)) = (self.status, &self.escrow_id) {
                    self.commands.push(SessionCommand::PollDeposits {
                        escrow_id: escrow_id.clone(),
                    });
                }
            }
            TimerKind::DepositTimeout => {
                if self.status == GameStatus::Depositing {
                    warn!(game_id = %self.id, "Deposits not received in time");
                    self.abandon(None, "deposit_timeout", now);
                }
            }
        }
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration) {
        let generation = self.timers.entry(kind).or_insert(0);
        *generation += 1;
        self.commands.push(SessionCommand::ScheduleTimer {
            kind,
            after,
            generation: *generation,
        });
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        *self.timers.entry(kind).or_insert(0) += 1;
    }

    fn cancel_all_timers(&mut self) {
        for kind in [
            TimerKind::TurnExpiry,
            TimerKind::AutoRoll,
            TimerKind::DisconnectTick,
            TimerKind::DepositPoll,
            TimerKind::DepositTimeout,
        ] {
            self.cancel_timer(kind);
        }
    }

    // =========================================================================
    // Disconnect / reconnect
    // =========================================================================

    /// A seated player's socket closed.
    pub fn handle_disconnect(&mut self, address: &str, now: Instant) {
        let Some(color) = self.color_of(address) else {
            return;
        };
        if let Some(seat) = self.seats[color.index()].as_mut() {
            seat.connected = false;
        }

        match self.status {
            GameStatus::Waiting => {
                info!(game_id = %self.id, %address, "Creator left before an opponent joined");
                self.abandon(None, "creator_left", now);
            }
            GameStatus::Depositing | GameStatus::Playing => {
                if self.disconnected.is_some() {
                    return;
                }
                self.start_grace(color, now);
            }
            GameStatus::Finished | GameStatus::Abandoned => {}
        }
    }

    fn start_grace(&mut self, color: Color, now: Instant) {
        let grace = self.ctx.config.disconnect_grace;
        self.disconnected = Some((color, now));
        if self.status == GameStatus::Playing {
            self.arm_clock(now);
        }
        info!(game_id = %self.id, player = %color, grace_secs = grace.as_secs(), "Disconnect grace started");

        self.send_to(color.opponent(), ServerMessage::OpponentDisconnected {
            game_id: self.id.clone(),
        });
        self.send_to(color.opponent(), ServerMessage::OpponentDisconnecting {
            game_id: self.id.clone(),
            grace_seconds: grace.as_secs(),
        });
        self.schedule(TimerKind::DisconnectTick, self.ctx.config.disconnect_tick.min(grace));
    }

    fn disconnect_tick(&mut self, now: Instant) {
        let Some((color, since)) = self.disconnected else {
            return;
        };
        let grace = self.ctx.config.disconnect_grace;
        let elapsed = now.saturating_duration_since(since);
        if elapsed >= grace {
            self.expire_grace(color, now);
            return;
        }

        let remaining = grace - elapsed;
        self.send_to(color.opponent(), ServerMessage::DisconnectCountdown {
            game_id: self.id.clone(),
            seconds_remaining: remaining.as_secs(),
        });
        self.schedule(
            TimerKind::DisconnectTick,
            self.ctx.config.disconnect_tick.min(remaining),
        );
    }

    fn expire_grace(&mut self, color: Color, now: Instant) {
        let opponent = color.opponent();
        let opponent_here = self.seat(opponent).map_or(false, |s| s.connected);
        self.disconnected = None;
        info!(game_id = %self.id, player = %color, "Disconnect grace expired");

        if self.status == GameStatus::Playing && opponent_here {
            self.abandon(Some(opponent), "disconnect_timeout", now);
        } else {
            self.abandon(None, "disconnect_timeout", now);
        }
    }

    /// A seated player returned on a new connection.
    pub fn handle_reconnect(&mut self, player: PlayerConnection, now: Instant) {
        let Some(color) = self.color_of(&player.address) else {
            return;
        };
        if let Some(seat) = self.seats[color.index()].as_mut() {
            seat.conn = player;
            seat.connected = true;
        }
        info!(game_id = %self.id, player = %color, "Player reconnected");

        if self.disconnected.map(|(c, _)| c) == Some(color) {
            self.disconnected = None;
            self.cancel_timer(TimerKind::DisconnectTick);
            self.send_to(color.opponent(), ServerMessage::OpponentReconnected {
                game_id: self.id.clone(),
            });

            let other_gone = self.seat(color.opponent()).map_or(false, |s| !s.connected);
            if other_gone && !self.is_over() {
                self.start_grace(color.opponent(), now);
            } else if self.status == GameStatus::Playing {
                self.clock.resume(now);
                self.arm_clock(now);
            }
        }

        if let Some(msg) = self.game_start_message(now) {
            self.send_to(color, msg);
        }
        if self.status == GameStatus::Playing && self.dice.is_none() {
            if let Some(hash) = self.dice_history.commit_hash(self.turn_number) {
                self.send_to(color, ServerMessage::DiceCommit {
                    game_id: self.id.clone(),
                    commit_hash: hash.to_string(),
                    turn_number: self.turn_number,
                });
            }
        }
    }

    // =========================================================================
    // Stalling
    // =========================================================================

    fn record_move_time(&mut self, color: Color, now: Instant) {
        if let Some(last) = self.last_action_at {
            let times = &mut self.move_times[color.index()];
            times.push_back(now.saturating_duration_since(last));
            while times.len() > self.ctx.config.stall_window {
                times.pop_front();
            }
        }
        self.last_action_at = Some(now);
    }

    fn check_stalling(&mut self, color: Color) {
        let idx = color.index();
        let window = self.ctx.config.stall_window;
        if window == 0 || self.stalling_warned[idx] || self.move_times[idx].len() < window {
            return;
        }
        let total: Duration = self.move_times[idx].iter().sum();
        let average = total / window as u32;
        if average > self.ctx.config.stall_threshold {
            self.stalling_warned[idx] = true;
            warn!(game_id = %self.id, player = %color, avg_secs = average.as_secs(), "Stalling detected");
            self.broadcast(ServerMessage::StallingWarning {
                game_id: self.id.clone(),
                message: format!(
                    "{} is averaging {}s per move",
                    color,
                    average.as_secs()
                ),
            });
        }
    }

    // =========================================================================
    // Game end
    // =========================================================================

    fn finish_game(&mut self, winner: Color, result_type: ResultType, reason: &str, now: Instant) {
        if self.is_over() {
            return;
        }
        self.status = GameStatus::Finished;
        self.winner = Some(winner);
        self.result_type = Some(result_type);
        self.clear_transient(now);

        let points = settlement_multiplier(result_type, self.cube_value);
        let outcome = self.match_id.as_ref().and_then(|_| {
            lock(&self.ctx.matches).score_game(&self.id, winner, result_type, self.cube_value)
        });
        let match_over = outcome.as_ref().map_or(true, |o| o.match_over);
        info!(
            game_id = %self.id,
            %winner,
            ?result_type,
            cube = self.cube_value,
            points,
            reason,
            match_over,
            "Game over"
        );

        self.broadcast(ServerMessage::GameOver {
            game_id: self.id.clone(),
            winner,
            result_type,
            cube_value: self.cube_value,
            points,
            game_state: self.snapshot(now),
            dice_history: self.dice_history.history(),
            match_over,
        });

        if let Some(match_id) = self.match_id.clone() {
            if !match_over {
                self.continue_match(match_id);
                return;
            }
            lock(&self.ctx.matches).remove_match(&match_id);
            let match_winner = outcome.and_then(|o| o.match_winner).unwrap_or(winner);
            self.settle_or_evict(match_winner, 1);
        } else {
            self.settle_or_evict(winner, points);
        }
    }

    fn continue_match(&mut self, match_id: MatchId) {
        let seats = (
            self.seat(Color::White).map(|s| s.conn.clone()),
            self.seat(Color::Black).map(|s| s.conn.clone()),
        );
        if let (Some(white), Some(black)) = seats {
            let escrow_id = match self.escrow_status {
                EscrowStatus::Active => self.escrow_id.clone(),
                _ => None,
            };
            self.commands.push(SessionCommand::NextGame {
                match_id,
                white,
                black,
                wager_amount: self.wager_amount,
                escrow_id,
            });
        }
        self.commands.push(SessionCommand::Evict);
    }

    /// Give up on a session whose handler failed. No winner is declared;
    /// any escrow is refunded before eviction.
    pub fn abort(&mut self, reason: &str, now: Instant) {
        if self.is_over() {
            self.commands.push(SessionCommand::Evict);
            return;
        }
        self.abandon(None, reason, now);
    }

    fn abandon(&mut self, winner: Option<Color>, reason: &str, now: Instant) {
        if self.is_over() {
            return;
        }
        self.status = GameStatus::Abandoned;
        self.winner = winner;
        self.result_type = winner.map(|_| ResultType::Normal);
        self.disconnected = None;
        self.clear_transient(now);

        let winner_address = winner.and_then(|c| self.address_of(c));
        warn!(game_id = %self.id, winner = ?winner_address, reason, "Game abandoned");
        self.broadcast(ServerMessage::GameAbandoned {
            game_id: self.id.clone(),
            winner: winner_address,
            reason: reason.to_string(),
        });

        if let Some(match_id) = &self.match_id {
            lock(&self.ctx.matches).remove_match(match_id);
        }

        if self.escrow_creating {
            // Cancelled once the creation result arrives.
            return;
        }
        let policy = self.ctx.config.abandonment_policy;
        match (self.escrow_status, winner, &self.escrow_id) {
            (EscrowStatus::Active, Some(w), Some(_)) if policy == AbandonmentPolicy::Settle => {
                let multiplier = if self.match_id.is_some() { 1 } else { self.cube_value };
                self.settle_or_evict(w, multiplier);
            }
            (EscrowStatus::Active | EscrowStatus::PendingDeposits, _, Some(escrow_id)) => {
                self.commands.push(SessionCommand::Cancel {
                    escrow_id: escrow_id.clone(),
                });
            }
            _ => self.commands.push(SessionCommand::Evict),
        }
    }

    fn clear_transient(&mut self, now: Instant) {
        self.double_offered_by = None;
        self.pending_resignation = None;
        self.pending_confirmation = false;
        self.awaiting_client_seed = false;
        self.clock.pause(now);
        self.cancel_all_timers();
    }

    fn settle_or_evict(&mut self, winner: Color, multiplier: u32) {
        match (self.escrow_status, &self.escrow_id, self.address_of(winner)) {
            (EscrowStatus::Active, Some(escrow_id), Some(address)) => {
                self.commands.push(SessionCommand::Settle {
                    escrow_id: escrow_id.clone(),
                    winner: address,
                    multiplier,
                });
            }
            _ => self.commands.push(SessionCommand::Evict),
        }
    }

    // =========================================================================
    // Escrow continuations
    // =========================================================================

    fn on_escrow_created(&mut self, result: Result<(), EscrowError>, now: Instant) {
        self.escrow_creating = false;

        if self.is_over() {
            match (result, &self.escrow_id) {
                (Ok(()), Some(escrow_id)) => {
                    self.escrow_status = EscrowStatus::PendingDeposits;
                    self.commands.push(SessionCommand::Cancel {
                        escrow_id: escrow_id.clone(),
                    });
                }
                _ => self.commands.push(SessionCommand::Evict),
            }
            return;
        }

        match result {
            Ok(()) => {
                self.escrow_status = EscrowStatus::PendingDeposits;
                self.broadcast(ServerMessage::EscrowCreated {
                    game_id: self.id.clone(),
                    wager_amount: self.wager_amount,
                });
                self.schedule(TimerKind::DepositPoll, self.ctx.config.deposit_poll);
                self.schedule(TimerKind::DepositTimeout, self.ctx.config.deposit_timeout);
            }
            Err(e) => {
                self.escrow_id = None;
                self.escrow_status = EscrowStatus::None;
                if self.ctx.config.allow_unwagered_fallback {
                    warn!(game_id = %self.id, error = %e, "Escrow unavailable, playing unwagered");
                    self.broadcast(ServerMessage::error(
                        ErrorCode::EscrowUnavailable,
                        "Wager pending: escrow unavailable, game continues without a wager",
                    ));
                    self.begin_play(now);
                } else {
                    warn!(game_id = %self.id, error = %e, "Escrow unavailable, abandoning");
                    self.broadcast(ServerMessage::error(
                        ErrorCode::EscrowUnavailable,
                        format!("Escrow unavailable: {}", e),
                    ));
                    self.abandon(None, "escrow_unavailable", now);
                }
            }
        }
    }

    fn on_deposit_polled(&mut self, result: Result<EscrowInfo, EscrowError>, now: Instant) {
        if self.status != GameStatus::Depositing {
            return;
        }
        match result {
            Ok(info) => {
                self.broadcast(ServerMessage::DepositStatus {
                    game_id: self.id.clone(),
                    player_a_deposited: info.player_a_deposited,
                    player_b_deposited: info.player_b_deposited,
                });
                if info.fully_funded() {
                    self.escrow_status = EscrowStatus::Active;
                    self.cancel_timer(TimerKind::DepositPoll);
                    self.cancel_timer(TimerKind::DepositTimeout);
                    self.broadcast(ServerMessage::EscrowActive { game_id: self.id.clone() });
                    self.begin_play(now);
                } else if info.status == EscrowStatus::Cancelled {
                    self.escrow_status = EscrowStatus::Cancelled;
                    self.abandon(None, "escrow_cancelled", now);
                } else {
                    self.schedule(TimerKind::DepositPoll, self.ctx.config.deposit_poll);
                }
            }
            Err(e) => {
                debug!(game_id = %self.id, error = %e, "Deposit poll failed");
                self.schedule(TimerKind::DepositPoll, self.ctx.config.deposit_poll);
            }
        }
    }

    fn on_escrow_settled(&mut self, winner: Address, multiplier: u32, result: Result<(), EscrowError>) {
        match result {
            Ok(()) => {
                self.escrow_status = EscrowStatus::Settled;
                self.broadcast(ServerMessage::EscrowSettled {
                    game_id: self.id.clone(),
                    winner,
                    multiplier,
                });
            }
            Err(e) => {
                error!(game_id = %self.id, %winner, error = %e, "Settlement failed");
                self.broadcast(ServerMessage::error(
                    ErrorCode::SettlementFailed,
                    format!("Settlement failed: {}", e),
                ));
            }
        }
        self.commands.push(SessionCommand::Evict);
    }

    fn on_escrow_cancelled(&mut self, result: Result<(), EscrowError>) {
        match result {
            Ok(()) => {
                self.escrow_status = EscrowStatus::Cancelled;
                self.broadcast(ServerMessage::EscrowCancelled { game_id: self.id.clone() });
            }
            Err(e) => {
                error!(game_id = %self.id, error = %e, "Escrow cancel failed");
                self.broadcast(ServerMessage::error(
                    ErrorCode::EscrowUnavailable,
                    format!("Refund failed: {}", e),
                ));
            }
        }
        self.commands.push(SessionCommand::Evict);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// A flagged player loses before anything else is granted, even if the
    /// expiry timer has not fired yet.
    fn enforce_clock(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.status != GameStatus::Playing {
            return Ok(());
        }
        let active = self.clock.active_player();
        if !self.clock.is_time_expired(active, now) {
            return Ok(());
        }
        info!(game_id = %self.id, player = %active, "Time expired before action");
        self.finish_game(active.opponent(), ResultType::Normal, "time_expired", now);
        Err(SessionError::InvalidState("Time expired"))
    }

    fn require_playing(&self) -> Result<(), SessionError> {
        match self.status {
            GameStatus::Playing => Ok(()),
            _ => Err(SessionError::InvalidState("Game is not in progress")),
        }
    }

    fn require_turn(&self, color: Color) -> Result<(), SessionError> {
        self.require_playing()?;
        if color != self.current_player {
            return Err(SessionError::NotYourTurn);
        }
        if self.double_offered_by.is_some() {
            return Err(SessionError::InvalidState("A double is awaiting an answer"));
        }
        Ok(())
    }

    fn seat(&self, color: Color) -> Option<&Seat> {
        self.seats[color.index()].as_ref()
    }

    fn address_of(&self, color: Color) -> Option<Address> {
        self.seat(color).map(|s| s.conn.address.clone())
    }

    fn game_start_message(&self, now: Instant) -> Option<ServerMessage> {
        Some(ServerMessage::GameStart {
            game_id: self.id.clone(),
            white: self.address_of(Color::White)?,
            black: self.address_of(Color::Black)?,
            game_state: self.snapshot(now),
        })
    }

    fn send_to(&self, color: Color, msg: ServerMessage) {
        if let Some(seat) = self.seat(color).filter(|s| s.connected) {
            seat.conn.send(msg);
        }
    }

    fn broadcast(&self, msg: ServerMessage) {
        self.broadcast_with(|_| msg.clone());
    }

    /// Send a message built per recipient (`None` for spectators).
    fn broadcast_with<F>(&self, build: F)
    where
        F: Fn(Option<Color>) -> ServerMessage,
    {
        for color in [Color::White, Color::Black] {
            self.send_to(color, build(Some(color)));
        }
        for spectator in &self.spectators {
            let _ = spectator.try_send(build(None));
        }
    }
}

fn lock(matches: &Mutex<MatchManager>) -> MutexGuard<'_, MatchManager> {
    matches.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fairness::verify_dice;
    use crate::game::StandardRules;
    use tokio::sync::mpsc::Receiver;

    const WHITE: &str = "xion1white";
    const BLACK: &str = "xion1black";

    struct Fixture {
        session: GameSession,
        white_rx: Receiver<ServerMessage>,
        black_rx: Receiver<ServerMessage>,
        matches: Arc<Mutex<MatchManager>>,
        t0: Instant,
    }

    impl Fixture {
        fn act(&mut self, address: &str, message: ClientMessage, after: Duration) -> Result<(), SessionError> {
            self.session.handle_client(address, message, self.t0 + after)
        }

        fn fire(&mut self, kind: TimerKind, after: Duration) {
            let generation = self.session.timers.get(&kind).copied().unwrap_or(0);
            self.session.handle_timer(kind, generation, self.t0 + after);
        }
    }

    fn fixture_with(config: SessionConfig, wager: u64, match_length: u32) -> Fixture {
        let matches = Arc::new(Mutex::new(MatchManager::new()));
        let ctx = SessionContext::new(config, Arc::new(StandardRules), matches.clone());
        let mut session = GameSession::new("1234".into(), ctx, wager, match_length);
        let (wtx, white_rx) = mpsc::channel(512);
        let (btx, black_rx) = mpsc::channel(512);
        let t0 = Instant::now();
        assert_eq!(
            session.join(PlayerConnection::new(WHITE.into(), 1500, wtx), t0),
            Ok(Color::White)
        );
        assert_eq!(
            session.join(PlayerConnection::new(BLACK.into(), 1500, btx), t0),
            Ok(Color::Black)
        );
        Fixture { session, white_rx, black_rx, matches, t0 }
    }

    fn fixture() -> Fixture {
        fixture_with(SessionConfig::default(), 0, 1)
    }

    fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn roll(game_id: &str) -> ClientMessage {
        ClientMessage::RollDice { game_id: game_id.into() }
    }

    fn gid() -> String {
        "1234".to_string()
    }

    /// Roll for the active player until the roll leaves them a move.
    fn roll_until_playable(f: &mut Fixture) -> Color {
        loop {
            let player = f.session.current_player;
            let address = if player == Color::White { WHITE } else { BLACK };
            f.act(address, roll(&gid()), secs(1)).unwrap();
            if f.session.current_player == player {
                return player;
            }
        }
    }

    #[test]
    fn test_unwagered_game_starts_immediately() {
        let mut f = fixture();
        assert_eq!(f.session.status(), GameStatus::Playing);
        assert_eq!(f.session.current_player, Color::White);
        assert_eq!(f.session.turn_number, 1);

        let msgs = drain(&mut f.white_rx);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::GameStart { .. })));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::DiceCommit { turn_number: 1, .. })));
        assert!(drain(&mut f.black_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::GameJoined { color: Color::Black, .. })));
    }

    #[test]
    fn test_third_player_cannot_join() {
        let mut f = fixture();
        let (tx, _rx) = mpsc::channel(8);
        let result = f.session.join(PlayerConnection::new("xion1late".into(), 1500, tx), f.t0);
        assert!(matches!(result, Err(SessionError::CannotJoin(_))));
    }

    #[test]
    fn test_only_active_player_rolls() {
        let mut f = fixture();
        assert_eq!(f.act(BLACK, roll(&gid()), secs(1)), Err(SessionError::NotYourTurn));
        assert_eq!(f.act("xion1nobody", roll(&gid()), secs(1)), Err(SessionError::NotInGame));
    }

    #[test]
    fn test_revealed_dice_verify_against_commit() {
        let mut f = fixture();
        f.act(
            WHITE,
            ClientMessage::SubmitClientSeed { game_id: gid(), client_seed: "abc".into() },
            secs(1),
        )
        .unwrap();
        f.act(WHITE, roll(&gid()), secs(2)).unwrap();

        let msgs = drain(&mut f.black_rx);
        let commit = msgs.iter().find_map(|m| match m {
            ServerMessage::DiceCommit { commit_hash, turn_number: 1, .. } => Some(commit_hash.clone()),
            _ => None,
        });
        let reveal = msgs.iter().find_map(|m| match m {
            ServerMessage::DiceRevealed { dice, server_seed, client_seed, commit_hash, turn_number, .. } => {
                Some((*dice, server_seed.clone(), client_seed.clone(), commit_hash.clone(), *turn_number))
            }
            _ => None,
        });
        let (dice, server_seed, client_seed, commit_hash, turn) = reveal.unwrap();
        assert_eq!(Some(commit_hash.clone()), commit);
        assert_eq!(client_seed, "abc");
        assert!(verify_dice(&commit_hash, &server_seed, &client_seed, turn, dice));
    }

    #[test]
    fn test_second_roll_rejected() {
        let mut f = fixture();
        let player = roll_until_playable(&mut f);
        let address = if player == Color::White { WHITE } else { BLACK };
        assert_eq!(
            f.act(address, roll(&gid()), secs(2)),
            Err(SessionError::InvalidState("Dice already rolled"))
        );
    }

    #[test]
    fn test_roll_waits_for_required_client_seed() {
        let config = SessionConfig { require_client_seed: true, ..SessionConfig::default() };
        let mut f = fixture_with(config, 0, 1);
        f.act(WHITE, roll(&gid()), secs(1)).unwrap();
        assert!(f.session.dice.is_none());
        assert!(f.session.awaiting_client_seed);

        f.act(
            WHITE,
            ClientMessage::SubmitClientSeed { game_id: gid(), client_seed: "seed".into() },
            secs(2),
        )
        .unwrap();
        assert!(f.session.dice.is_some() || f.session.turn_number == 2);
        assert_eq!(f.session.dice_history.history()[0].client_seed, "seed");
    }

    #[test]
    fn test_move_undo_and_end_turn() {
        let mut f = fixture();
        let player = roll_until_playable(&mut f);
        let address = if player == Color::White { WHITE } else { BLACK };
        let start_board = f.session.board.clone();

        assert!(matches!(
            f.act(address, ClientMessage::Move { game_id: gid(), from: 3, to: 2 }, secs(2)),
            Err(SessionError::InvalidMove(_))
        ));

        let first = f.session.legal_moves()[0];
        f.act(address, ClientMessage::Move { game_id: gid(), from: first.from, to: first.to }, secs(3))
            .unwrap();
        assert_ne!(f.session.board, start_board);
        assert_eq!(
            f.act(address, ClientMessage::EndTurn { game_id: gid() }, secs(4)),
            Err(SessionError::CannotEndTurn)
        );

        f.act(address, ClientMessage::UndoMove { game_id: gid() }, secs(5)).unwrap();
        assert_eq!(f.session.board, start_board);
        assert_eq!(
            f.act(address, ClientMessage::UndoMove { game_id: gid() }, secs(5)),
            Err(SessionError::CannotUndo)
        );

        while let Some(mv) = f.session.legal_moves().first().copied() {
            f.act(address, ClientMessage::Move { game_id: gid(), from: mv.from, to: mv.to }, secs(6))
                .unwrap();
        }
        assert!(f.session.pending_confirmation);

        let turn = f.session.turn_number;
        f.act(address, ClientMessage::EndTurn { game_id: gid() }, secs(7)).unwrap();
        assert_eq!(f.session.turn_number, turn + 1);
        assert_eq!(f.session.current_player, player.opponent());
        assert!(f.session.turn_stack.is_empty());
    }

    #[test]
    fn test_double_accept_transfers_cube() {
        let mut f = fixture();
        f.act(WHITE, ClientMessage::OfferDouble { game_id: gid() }, secs(1)).unwrap();
        assert_eq!(f.act(WHITE, roll(&gid()), secs(2)), Err(SessionError::InvalidState("A double is awaiting an answer")));
        assert_eq!(
            f.act(WHITE, ClientMessage::AcceptDouble { game_id: gid() }, secs(2)),
            Err(SessionError::NotYourTurn)
        );

        f.act(BLACK, ClientMessage::AcceptDouble { game_id: gid() }, secs(3)).unwrap();
        assert_eq!(f.session.cube_value, 2);
        assert_eq!(f.session.cube_owner, Some(Color::Black));

        // White no longer owns the cube.
        assert!(matches!(
            f.act(WHITE, ClientMessage::OfferDouble { game_id: gid() }, secs(4)),
            Err(SessionError::DoubleNotAllowed(_))
        ));
    }

    #[test]
    fn test_double_reject_ends_game_at_old_cube() {
        let mut f = fixture();
        f.act(WHITE, ClientMessage::OfferDouble { game_id: gid() }, secs(1)).unwrap();
        f.act(BLACK, ClientMessage::RejectDouble { game_id: gid() }, secs(2)).unwrap();

        assert_eq!(f.session.status(), GameStatus::Finished);
        assert_eq!(f.session.winner, Some(Color::White));
        assert_eq!(f.session.cube_value, 1);
        let over = drain(&mut f.black_rx).into_iter().find_map(|m| match m {
            ServerMessage::GameOver { points, match_over, .. } => Some((points, match_over)),
            _ => None,
        });
        assert_eq!(over, Some((1, true)));
        assert!(f
            .session
            .take_commands()
            .iter()
            .any(|c| matches!(c, SessionCommand::Evict)));
    }

    #[test]
    fn test_no_double_after_rolling() {
        let mut f = fixture();
        let player = roll_until_playable(&mut f);
        let address = if player == Color::White { WHITE } else { BLACK };
        assert!(matches!(
            f.act(address, ClientMessage::OfferDouble { game_id: gid() }, secs(2)),
            Err(SessionError::DoubleNotAllowed(_))
        ));
    }

    #[test]
    fn test_resignation_flow() {
        let mut f = fixture();
        f.act(BLACK, ClientMessage::Resign { game_id: gid(), resign_type: ResultType::Gammon }, secs(1))
            .unwrap();
        assert!(matches!(
            f.act(BLACK, ClientMessage::AcceptResign { game_id: gid() }, secs(2)),
            Err(SessionError::InvalidState(_))
        ));
        f.act(WHITE, ClientMessage::RejectResign { game_id: gid() }, secs(2)).unwrap();
        assert_eq!(f.session.status(), GameStatus::Playing);

        f.act(BLACK, ClientMessage::Resign { game_id: gid(), resign_type: ResultType::Gammon }, secs(3))
            .unwrap();
        f.act(WHITE, ClientMessage::AcceptResign { game_id: gid() }, secs(4)).unwrap();
        assert_eq!(f.session.winner, Some(Color::White));
        assert_eq!(f.session.result_type, Some(ResultType::Gammon));
    }

    #[test]
    fn test_time_expiry_loses() {
        let mut f = fixture();
        f.fire(TimerKind::TurnExpiry, secs(181));
        assert_eq!(f.session.status(), GameStatus::Finished);
        assert_eq!(f.session.winner, Some(Color::Black));
    }

    #[test]
    fn test_action_after_flag_fall_loses() {
        let mut f = fixture();
        drain(&mut f.white_rx);

        // The expiry timer has not been delivered yet.
        let result = f.act(WHITE, roll(&gid()), secs(185));
        assert_eq!(result, Err(SessionError::InvalidState("Time expired")));
        assert_eq!(f.session.status(), GameStatus::Finished);
        assert_eq!(f.session.winner, Some(Color::Black));
        assert!(f.session.dice.is_none());
        assert!(drain(&mut f.white_rx).iter().any(|m| matches!(
            m,
            ServerMessage::GameOver { winner: Color::Black, result_type: ResultType::Normal, .. }
        )));
    }

    #[test]
    fn test_end_turn_after_flag_fall_gets_no_increment() {
        let mut f = fixture();
        let player = roll_until_playable(&mut f);
        assert_eq!(player, Color::White);
        while let Some(mv) = f.session.legal_moves().first().copied() {
            f.act(WHITE, ClientMessage::Move { game_id: gid(), from: mv.from, to: mv.to }, secs(2))
                .unwrap();
        }

        assert!(f.act(WHITE, ClientMessage::EndTurn { game_id: gid() }, secs(185)).is_err());
        assert_eq!(f.session.status(), GameStatus::Finished);
        assert_eq!(f.session.winner, Some(Color::Black));
        assert_eq!(f.session.clock.remaining_ms(Color::White, f.t0 + secs(185)), 0);
    }


    #[test]
    fn test_stale_turn_expiry_after_double_is_ignored() {
        let mut f = fixture();
        let stale = f.session.timers[&TimerKind::TurnExpiry];
        f.act(WHITE, ClientMessage::OfferDouble { game_id: gid() }, secs(1)).unwrap();
        f.session.handle_timer(TimerKind::TurnExpiry, stale, f.t0 + secs(500));
        assert_eq!(f.session.status(), GameStatus::Playing);
    }

    #[test]
    fn test_disconnect_grace_expiry_abandons() {
        let mut f = fixture();
        f.session.handle_disconnect(BLACK, f.t0 + secs(1));
        assert!(f.session.clock.is_paused());

        let msgs = drain(&mut f.white_rx);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::OpponentDisconnecting { grace_seconds: 30, .. })));

        f.fire(TimerKind::DisconnectTick, secs(6));
        assert!(drain(&mut f.white_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::DisconnectCountdown { seconds_remaining: 25, .. })));

        f.fire(TimerKind::DisconnectTick, secs(31));
        assert_eq!(f.session.status(), GameStatus::Abandoned);
        assert_eq!(f.session.winner, Some(Color::White));
    }

    #[test]
    fn test_reconnect_cancels_grace() {
        let mut f = fixture();
        f.session.handle_disconnect(WHITE, f.t0 + secs(1));
        let tick = f.session.timers[&TimerKind::DisconnectTick];

        let (tx, mut rx) = mpsc::channel(64);
        f.session
            .handle_reconnect(PlayerConnection::new(WHITE.into(), 1500, tx), f.t0 + secs(10));
        assert!(!f.session.clock.is_paused());
        assert!(drain(&mut f.black_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::OpponentReconnected { .. })));
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::GameStart { .. })));

        f.session.handle_timer(TimerKind::DisconnectTick, tick, f.t0 + secs(40));
        assert_eq!(f.session.status(), GameStatus::Playing);
        // Paused time is not charged to white.
        assert_eq!(f.session.clock.remaining_ms(Color::White, f.t0 + secs(10)), 179_000);
    }

    #[test]
    fn test_reconnect_at_grace_deadline_beats_stale_tick() {
        let mut f = fixture();
        f.session.handle_disconnect(BLACK, f.t0 + secs(1));
        let tick = f.session.timers[&TimerKind::DisconnectTick];

        let (tx, _rx) = mpsc::channel(64);
        f.session
            .handle_reconnect(PlayerConnection::new(BLACK.into(), 1500, tx), f.t0 + secs(31));

        // Scheduled before the reconnect, delivered at the same instant.
        f.session.handle_timer(TimerKind::DisconnectTick, tick, f.t0 + secs(31));
        assert_eq!(f.session.status(), GameStatus::Playing);
        assert!(f.session.disconnected.is_none());

        f.fire(TimerKind::DisconnectTick, secs(31));
        assert_eq!(f.session.status(), GameStatus::Playing);
    }


    #[test]
    fn test_wagered_deposit_flow_to_settlement() {
        let mut f = fixture_with(SessionConfig::default(), 100, 1);
        assert_eq!(f.session.status(), GameStatus::Depositing);
        let cmds = f.session.take_commands();
        assert!(cmds.iter().any(|c| matches!(
            c,
            SessionCommand::CreateEscrow { escrow_id, wager_amount: 100, .. } if escrow_id == "1234"
        )));

        f.session.handle_event(SessionEvent::EscrowCreated(Ok(())), f.t0);
        assert_eq!(f.session.escrow_status(), EscrowStatus::PendingDeposits);

        let partial = EscrowInfo {
            game_id: "1234".into(),
            player_a: WHITE.into(),
            player_b: BLACK.into(),
            wager_amount: "100".into(),
            status: EscrowStatus::PendingDeposits,
            player_a_deposited: true,
            player_b_deposited: false,
        };
        f.session.handle_event(SessionEvent::DepositPolled(Ok(partial.clone())), f.t0);
        assert_eq!(f.session.status(), GameStatus::Depositing);

        let funded = EscrowInfo { status: EscrowStatus::Active, player_b_deposited: true, ..partial };
        f.session.handle_event(SessionEvent::DepositPolled(Ok(funded)), f.t0);
        assert_eq!(f.session.status(), GameStatus::Playing);
        assert_eq!(f.session.escrow_status(), EscrowStatus::Active);

        f.session.take_commands();
        f.act(WHITE, ClientMessage::Resign { game_id: gid(), resign_type: ResultType::Normal }, secs(1))
            .unwrap();
        f.act(BLACK, ClientMessage::AcceptResign { game_id: gid() }, secs(2)).unwrap();
        let cmds = f.session.take_commands();
        assert!(cmds.iter().any(|c| matches!(
            c,
            SessionCommand::Settle { winner, multiplier: 1, .. } if winner == BLACK
        )));
    }

    fn funded_fixture(config: SessionConfig) -> Fixture {
        let mut f = fixture_with(config, 100, 1);
        f.session.handle_event(SessionEvent::EscrowCreated(Ok(())), f.t0);
        let funded = EscrowInfo {
            game_id: "1234".into(),
            player_a: WHITE.into(),
            player_b: BLACK.into(),
            wager_amount: "100".into(),
            status: EscrowStatus::Active,
            player_a_deposited: true,
            player_b_deposited: true,
        };
        f.session.handle_event(SessionEvent::DepositPolled(Ok(funded)), f.t0);
        assert_eq!(f.session.status(), GameStatus::Playing);
        f.session.take_commands();
        f
    }

    #[test]
    fn test_abandonment_settles_by_default() {
        let mut f = funded_fixture(SessionConfig::default());
        f.session.handle_disconnect(BLACK, f.t0 + secs(1));
        f.fire(TimerKind::DisconnectTick, secs(31));

        assert_eq!(f.session.status(), GameStatus::Abandoned);
        assert!(f.session.take_commands().iter().any(|c| matches!(
            c,
            SessionCommand::Settle { winner, multiplier: 1, .. } if winner == WHITE
        )));
    }

    #[test]
    fn test_abandonment_cancel_policy_refunds() {
        let config = SessionConfig {
            abandonment_policy: AbandonmentPolicy::Cancel,
            ..SessionConfig::default()
        };
        let mut f = funded_fixture(config);
        f.session.handle_disconnect(BLACK, f.t0 + secs(1));
        f.fire(TimerKind::DisconnectTick, secs(31));

        assert_eq!(f.session.status(), GameStatus::Abandoned);
        assert_eq!(f.session.winner, Some(Color::White));
        let cmds = f.session.take_commands();
        assert!(cmds
            .iter()
            .any(|c| matches!(c, SessionCommand::Cancel { escrow_id } if escrow_id == "1234")));
        assert!(!cmds.iter().any(|c| matches!(c, SessionCommand::Settle { .. })));
    }

    #[test]
    fn test_abandon_during_escrow_creation_defers_cancel() {
        let mut f = fixture_with(SessionConfig::default(), 100, 1);
        f.session.take_commands();
        f.session.handle_disconnect(BLACK, f.t0);
        f.fire(TimerKind::DisconnectTick, secs(30));
        assert_eq!(f.session.status(), GameStatus::Abandoned);

        let cmds = f.session.take_commands();
        assert!(!cmds
            .iter()
            .any(|c| matches!(c, SessionCommand::Cancel { .. } | SessionCommand::Evict)));

        f.session.handle_event(SessionEvent::EscrowCreated(Ok(())), f.t0 + secs(32));
        let cmds = f.session.take_commands();
        assert!(cmds
            .iter()
            .any(|c| matches!(c, SessionCommand::Cancel { escrow_id } if escrow_id == "1234")));
        assert!(!cmds.iter().any(|c| matches!(c, SessionCommand::ScheduleTimer { .. })));

        f.session.handle_event(SessionEvent::EscrowCancelled(Ok(())), f.t0 + secs(33));
        assert_eq!(f.session.escrow_status(), EscrowStatus::Cancelled);
        assert!(f
            .session
            .take_commands()
            .iter()
            .any(|c| matches!(c, SessionCommand::Evict)));
    }


    #[test]
    fn test_escrow_failure_with_fallback_plays_unwagered() {
        let mut f = fixture_with(SessionConfig::default(), 100, 1);
        f.session
            .handle_event(SessionEvent::EscrowCreated(Err(EscrowError::NotConfigured)), f.t0);
        assert_eq!(f.session.status(), GameStatus::Playing);
        assert_eq!(f.session.escrow_status(), EscrowStatus::None);
        assert!(drain(&mut f.white_rx).iter().any(|m| matches!(
            m,
            ServerMessage::Error { code: ErrorCode::EscrowUnavailable, .. }
        )));
    }

    #[test]
    fn test_escrow_failure_without_fallback_abandons() {
        let config = SessionConfig { allow_unwagered_fallback: false, ..SessionConfig::default() };
        let mut f = fixture_with(config, 100, 1);
        f.session.take_commands();
        f.session.handle_event(
            SessionEvent::EscrowCreated(Err(EscrowError::Transport("down".into()))),
            f.t0,
        );
        assert_eq!(f.session.status(), GameStatus::Abandoned);
        assert!(f
            .session
            .take_commands()
            .iter()
            .any(|c| matches!(c, SessionCommand::Evict)));
    }

    #[test]
    fn test_deposit_timeout_cancels_escrow() {
        let mut f = fixture_with(SessionConfig::default(), 100, 1);
        f.session.handle_event(SessionEvent::EscrowCreated(Ok(())), f.t0);
        f.session.take_commands();
        f.fire(TimerKind::DepositTimeout, secs(300));
        assert_eq!(f.session.status(), GameStatus::Abandoned);
        assert!(f
            .session
            .take_commands()
            .iter()
            .any(|c| matches!(c, SessionCommand::Cancel { .. })));
    }

    #[test]
    fn test_match_continues_then_crawford() {
        let mut f = fixture_with(SessionConfig::default(), 0, 3);
        let match_id = f.session.match_id().map(str::to_string).unwrap();
        f.session.take_commands();

        f.act(BLACK, ClientMessage::Resign { game_id: gid(), resign_type: ResultType::Gammon }, secs(1))
            .unwrap();
        f.act(WHITE, ClientMessage::AcceptResign { game_id: gid() }, secs(2)).unwrap();

        let cmds = f.session.take_commands();
        let next = cmds.into_iter().find_map(|c| match c {
            SessionCommand::NextGame { white, black, .. } => Some((white, black)),
            _ => None,
        });
        let (white, black) = next.unwrap();

        let ctx = f.session.ctx.clone();
        lock(&f.matches).set_current_game(&match_id, "5678".into());
        let mut next_game =
            GameSession::next_in_match("5678".into(), ctx, match_id, white, black, 0, None);
        next_game.start_continuation(f.t0);
        assert_eq!(next_game.status(), GameStatus::Playing);
        assert!(next_game.snapshot(f.t0).is_crawford);
        assert!(matches!(
            next_game.handle_client(WHITE, ClientMessage::OfferDouble { game_id: "5678".into() }, f.t0),
            Err(SessionError::DoubleNotAllowed("Crawford game"))
        ));
    }

    #[test]
    fn test_match_over_on_backgammon() {
        let mut f = fixture_with(SessionConfig::default(), 0, 3);
        f.session.take_commands();
        f.act(WHITE, ClientMessage::Resign { game_id: gid(), resign_type: ResultType::Backgammon }, secs(1))
            .unwrap();
        f.act(BLACK, ClientMessage::AcceptResign { game_id: gid() }, secs(2)).unwrap();

        let over = drain(&mut f.white_rx).into_iter().find_map(|m| match m {
            ServerMessage::GameOver { points, match_over, .. } => Some((points, match_over)),
            _ => None,
        });
        assert_eq!(over, Some((3, true)));
        assert!(lock(&f.matches).is_empty());
        let cmds = f.session.take_commands();
        assert!(!cmds.iter().any(|c| matches!(c, SessionCommand::NextGame { .. })));
    }

    #[test]
    fn test_stalling_warning_once() {
        let config = SessionConfig {
            stall_window: 2,
            stall_threshold: secs(5),
            ..SessionConfig::default()
        };
        let mut f = fixture_with(config, 0, 1);
        f.session.record_move_time(Color::White, f.t0 + secs(10));
        f.session.record_move_time(Color::White, f.t0 + secs(20));
        f.session.check_stalling(Color::White);
        f.session.check_stalling(Color::White);

        let warnings = drain(&mut f.black_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::StallingWarning { .. }))
            .count();
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_auto_roll_fires_for_idle_player() {
        let mut f = fixture();
        f.fire(TimerKind::AutoRoll, secs(30));
        assert!(f.session.dice.is_some() || f.session.turn_number == 2);
        assert!(f.session.dice_history.is_revealed(1));
    }
}
