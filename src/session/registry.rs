//! Session Registry
//!
//! Index of running sessions by game id and of seated players by address.
//! Creating a game builds the [`GameSession`], seats the creator and spawns
//! its runner; everything after that goes through the session's queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::ids::generate_short_id;
use crate::core::{Address, GameId, MatchId};
use crate::escrow::EscrowCoordinator;
use crate::game::Color;
use crate::network::protocol::{ClientMessage, ServerMessage};

use super::game::SessionContext;
use super::runner::spawn_session;
use super::{GameFactory, GameSession, PlayerConnection, SessionError, SessionEvent, SessionHandle};

/// All live game sessions.
pub struct SessionRegistry {
    games: RwLock<BTreeMap<GameId, SessionHandle>>,
    players: RwLock<BTreeMap<Address, GameId>>,
    ctx: SessionContext,
    escrow: Arc<EscrowCoordinator>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new(ctx: SessionContext, escrow: Arc<EscrowCoordinator>) -> Self {
        Self {
            games: RwLock::new(BTreeMap::new()),
            players: RwLock::new(BTreeMap::new()),
            ctx,
            escrow,
        }
    }

    /// Escrow coordinator shared by all sessions.
    pub fn escrow(&self) -> &Arc<EscrowCoordinator> {
        &self.escrow
    }

    /// Shared session collaborators.
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Create a game with `creator` seated as white.
    pub async fn create_game(
        self: &Arc<Self>,
        creator: PlayerConnection,
        wager_amount: u64,
        match_length: u32,
    ) -> Result<GameId, SessionError> {
        self.ensure_free(&creator.address).await?;

        let mut games = self.games.write().await;
        let game_id = generate_short_id(|id| games.contains_key(id));
        let mut session =
            GameSession::new(game_id.clone(), self.ctx.clone(), wager_amount, match_length);
        session.join(creator.clone(), Instant::now().into_std())?;

        games.insert(game_id.clone(), spawn_session(session, self.clone()));
        self.players
            .write()
            .await
            .insert(creator.address.clone(), game_id.clone());
        drop(games);

        creator.send(ServerMessage::GameCreated {
            game_id: game_id.clone(),
            color: Color::White,
        });
        info!(game_id = %game_id, creator = %creator.address, wager_amount, match_length, "Game created");
        Ok(game_id)
    }

    /// Take the free seat in `game_id`.
    pub async fn join_game(
        &self,
        game_id: &str,
        player: PlayerConnection,
    ) -> Result<Color, SessionError> {
        self.ensure_free(&player.address).await?;
        let handle = self.handle(game_id).await.ok_or(SessionError::GameNotFound)?;

        let address = player.address.clone();
        let (reply, rx) = oneshot::channel();
        handle.send(SessionEvent::Join { player, reply }).await?;
        let color = rx
            .await
            .map_err(|_| SessionError::Internal("session closed during join".into()))??;

        self.players
            .write()
            .await
            .insert(address, game_id.to_string());
        Ok(color)
    }

    /// Attach a spectator channel to `game_id`.
    pub async fn spectate(
        &self,
        game_id: &str,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), SessionError> {
        let handle = self.handle(game_id).await.ok_or(SessionError::GameNotFound)?;
        handle.send(SessionEvent::Spectate { sender }).await
    }

    /// Forward an in-game action to its session.
    pub async fn route(
        &self,
        address: &str,
        reply: mpsc::Sender<ServerMessage>,
        message: ClientMessage,
    ) -> Result<(), SessionError> {
        let game_id = message
            .game_id()
            .ok_or(SessionError::InvalidState("Message has no game"))?;
        let handle = self.handle(game_id).await.ok_or(SessionError::GameNotFound)?;
        handle
            .send(SessionEvent::Client {
                address: address.to_string(),
                reply,
                message,
            })
            .await
    }

    /// A player's socket closed.
    pub async fn disconnect(&self, address: &str) {
        let Some(handle) = self.handle_for_player(address).await else {
            return;
        };
        debug!(game_id = %handle.game_id(), %address, "Forwarding disconnect");
        let _ = handle
            .send(SessionEvent::Disconnect { address: address.to_string() })
            .await;
    }

    /// Rebind a returning player to their game. Returns the game id.
    pub async fn reconnect(&self, player: PlayerConnection) -> Option<GameId> {
        let handle = self.handle_for_player(&player.address).await?;
        let game_id = handle.game_id().to_string();
        handle.send(SessionEvent::Reconnect { player }).await.ok()?;
        Some(game_id)
    }

    /// Create and start the next game of a running match.
    pub async fn start_next_game(
        self: &Arc<Self>,
        match_id: MatchId,
        white: PlayerConnection,
        black: PlayerConnection,
        wager_amount: u64,
        escrow_id: Option<String>,
    ) -> GameId {
        let addresses = [white.address.clone(), black.address.clone()];

        let mut games = self.games.write().await;
        let game_id = generate_short_id(|id| games.contains_key(id));
        self.ctx
            .matches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .set_current_game(&match_id, game_id.clone());

        let mut session = GameSession::next_in_match(
            game_id.clone(),
            self.ctx.clone(),
            match_id,
            white,
            black,
            wager_amount,
            escrow_id,
        );
        session.start_continuation(Instant::now().into_std());
        games.insert(game_id.clone(), spawn_session(session, self.clone()));

        let mut players = self.players.write().await;
        for address in addresses {
            players.insert(address, game_id.clone());
        }
        game_id
    }

    /// Drop a finished session. Addresses already bound to a newer game
    /// keep that binding.
    pub async fn remove_game(&self, game_id: &str, addresses: &[Address]) {
        self.games.write().await.remove(game_id);
        let mut players = self.players.write().await;
        for address in addresses {
            if players.get(address).map(String::as_str) == Some(game_id) {
                players.remove(address);
            }
        }
        debug!(game_id, "Session removed");
    }

    /// Handle of a running game.
    pub async fn handle(&self, game_id: &str) -> Option<SessionHandle> {
        self.games.read().await.get(game_id).cloned()
    }

    /// Game `address` is seated in.
    pub async fn player_game(&self, address: &str) -> Option<GameId> {
        self.players.read().await.get(address).cloned()
    }

    /// Number of live sessions.
    pub async fn game_count(&self) -> usize {
        self.games.read().await.len()
    }

    async fn handle_for_player(&self, address: &str) -> Option<SessionHandle> {
        let game_id = self.player_game(address).await?;
        self.handle(&game_id).await
    }

    async fn ensure_free(&self, address: &str) -> Result<(), SessionError> {
        match self.handle_for_player(address).await {
            Some(handle) if !handle.is_closed() => Err(SessionError::CannotJoin("already in a game")),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl GameFactory for Arc<SessionRegistry> {
    async fn create_paired_game(
        &self,
        white: PlayerConnection,
        black: PlayerConnection,
        wager_amount: u64,
        match_length: u32,
    ) -> Result<GameId, SessionError> {
        self.ensure_free(&white.address).await?;
        self.ensure_free(&black.address).await?;

        let mut games = self.games.write().await;
        let game_id = generate_short_id(|id| games.contains_key(id));
        let mut session =
            GameSession::new(game_id.clone(), self.ctx.clone(), wager_amount, match_length);

        white.send(ServerMessage::GameJoined {
            game_id: game_id.clone(),
            color: Color::White,
            opponent: Some(black.address.clone()),
        });
        let now = Instant::now().into_std();
        session.join(white.clone(), now)?;
        session.join(black.clone(), now)?;

        games.insert(game_id.clone(), spawn_session(session, self.clone()));
        let mut players = self.players.write().await;
        players.insert(white.address, game_id.clone());
        players.insert(black.address, game_id.clone());
        Ok(game_id)
    }
}
