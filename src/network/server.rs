//! WebSocket Game Server
//!
//! Async WebSocket server for player connections.
//! Handles authentication, matchmaking, and routing of in-game messages
//! to their game sessions.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::Address;
use crate::escrow::{EscrowClient, EscrowCoordinator, EscrowError};
use crate::game::StandardRules;
use crate::network::auth::{authenticate, AuthOutcome, NonceStore};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::session::{
    MatchManager, Matchmaker, MatchmakingEntry, PlayerConnection, QueueOutcome, SessionContext,
    SessionRegistry,
};

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Escrow backend could not be set up.
    #[error("Escrow setup failed: {0}")]
    Escrow(#[from] EscrowError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Connected client state.
struct ConnectedClient {
    /// Verified address (after auth).
    address: Option<Address>,
    /// Matchmaking rating.
    rating: u32,
    /// Connection time.
    connected_at: Instant,
}

/// State shared by every connection task.
#[derive(Clone)]
struct ServerState {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    matchmaker: Arc<Matchmaker>,
    nonces: Arc<NonceStore>,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
}

/// The game server.
pub struct GameServer {
    state: ServerState,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Result<Self, GameServerError> {
        let client = EscrowClient::from_config(&config.escrow)?;
        let escrow = EscrowCoordinator::new(client, &config.escrow);
        if !escrow.is_configured() {
            warn!("Escrow not configured; wagered games follow the unwagered fallback policy");
        }

        let ctx = SessionContext::new(
            config.session.clone(),
            Arc::new(StandardRules),
            Arc::new(Mutex::new(MatchManager::new())),
        );
        let registry = Arc::new(SessionRegistry::new(ctx, Arc::new(escrow)));
        let matchmaker = Arc::new(Matchmaker::new(config.matchmaking.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            state: ServerState {
                config: Arc::new(config),
                registry,
                matchmaker,
                nonces: Arc::new(NonceStore::new()),
                clients: Arc::new(RwLock::new(BTreeMap::new())),
            },
            shutdown_tx,
        })
    }

    /// Run the server until [`shutdown`](Self::shutdown) is called.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        info!("Game server listening on {}", self.state.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.state.clients.read().await.len();
                            if clients_count >= self.state.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let state = self.state.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_SIZE);

            state.register(addr).await;

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidMessage,
                                            "Invalid message format",
                                        )).await;
                                        continue;
                                    }
                                };
                                state.handle_client_message(addr, client_msg, &msg_tx).await;
                            }
                            Some(Ok(Message::Ping(_))) => {
                                let _ = msg_tx.send(ServerMessage::Pong {
                                    timestamp: 0,
                                    server_time: now_millis(),
                                }).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            drop(msg_tx);
            sender_task.abort();
            state.cleanup(addr).await;
            info!("Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.state.clients.read().await.len()
    }

    /// Get live game count.
    pub async fn game_count(&self) -> usize {
        self.state.registry.game_count().await
    }

    /// Get matchmaking queue size.
    pub async fn queue_size(&self) -> usize {
        self.state.matchmaker.queue_size().await
    }
}

impl ServerState {
    async fn register(&self, addr: SocketAddr) {
        self.clients.write().await.insert(
            addr,
            ConnectedClient {
                address: None,
                rating: self.config.matchmaking.default_rating,
                connected_at: Instant::now(),
            },
        );
    }

    /// Forget the connection; report a disconnect unless the player is
    /// still connected on another socket.
    async fn cleanup(&self, addr: SocketAddr) {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.remove(&addr) else {
            return;
        };
        let Some(address) = client.address else {
            return;
        };
        let still_connected = clients
            .values()
            .any(|c| c.address.as_deref() == Some(address.as_str()));
        drop(clients);

        debug!(
            %address,
            connected_secs = client.connected_at.elapsed().as_secs(),
            "Authenticated client left"
        );
        if still_connected {
            return;
        }
        if self.matchmaker.remove_from_queue(&address).await {
            debug!(%address, "Removed from matchmaking queue");
        }
        self.registry.disconnect(&address).await;
    }

    /// The authenticated player behind `addr`.
    async fn player(
        &self,
        addr: SocketAddr,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Option<PlayerConnection> {
        let clients = self.clients.read().await;
        let client = clients.get(&addr)?;
        let address = client.address.clone()?;
        Some(PlayerConnection::new(address, client.rating, sender.clone()))
    }

    /// Handle a client message.
    async fn handle_client_message(
        &self,
        addr: SocketAddr,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::Auth { address, token } => {
                self.handle_auth(addr, address, token, sender).await;
                return;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender
                    .send(ServerMessage::Pong {
                        timestamp,
                        server_time: now_millis(),
                    })
                    .await;
                return;
            }
            _ => {}
        }

        let Some(player) = self.player(addr, sender).await else {
            let _ = sender
                .send(ServerMessage::error(
                    ErrorCode::NotAuthenticated,
                    "Authenticate first",
                ))
                .await;
            return;
        };

        let address = player.address.clone();
        let result = match msg {
            ClientMessage::CreateGame { wager_amount, match_length } => self
                .registry
                .create_game(player, wager_amount, match_length)
                .await
                .map(|_| ()),
            ClientMessage::JoinGame { game_id } => {
                self.registry.join_game(&game_id, player).await.map(|_| ())
            }
            ClientMessage::JoinQueue { wager_amount, match_length } => {
                let entry = MatchmakingEntry::new(player, wager_amount, match_length);
                match self.matchmaker.add_to_queue(entry, &self.registry).await {
                    Ok(QueueOutcome::Queued { position }) => {
                        let _ = sender.send(ServerMessage::QueueJoined { position }).await;
                        Ok(())
                    }
                    Ok(QueueOutcome::Matched { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            ClientMessage::LeaveQueue => {
                self.matchmaker.remove_from_queue(&address).await;
                let _ = sender.send(ServerMessage::QueueLeft).await;
                Ok(())
            }
            ClientMessage::Spectate { game_id } => {
                self.registry.spectate(&game_id, sender.clone()).await
            }
            in_game => {
                self.registry
                    .route(&address, sender.clone(), in_game)
                    .await
            }
        };

        if let Err(e) = result {
            debug!(%address, error = %e, "Request rejected");
            let _ = sender.send(e.to_message()).await;
        }
    }

    /// Handle authentication.
    async fn handle_auth(
        &self,
        addr: SocketAddr,
        claimed: Option<Address>,
        token: Option<String>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let outcome = authenticate(
            &self.config.auth,
            &self.nonces,
            claimed.as_deref(),
            token.as_deref(),
            Instant::now(),
        );

        let (address, rating) = match outcome {
            Ok(AuthOutcome::Verified { address, rating }) => (address, rating),
            Ok(AuthOutcome::Challenge { nonce }) => {
                let _ = sender.send(ServerMessage::AuthChallenge { nonce }).await;
                return;
            }
            Err(e) => {
                warn!("Authentication failed for {}: {}", addr, e);
                let _ = sender
                    .send(ServerMessage::error(ErrorCode::AuthFailed, e.to_string()))
                    .await;
                return;
            }
        };

        let rating = rating.unwrap_or(self.config.matchmaking.default_rating);
        {
            let mut clients = self.clients.write().await;
            if let Some(client) = clients.get_mut(&addr) {
                client.address = Some(address.clone());
                client.rating = rating;
            }
        }
        info!(%address, %addr, "Authenticated");
        let _ = sender
            .send(ServerMessage::AuthOk { address: address.clone() })
            .await;

        let player = PlayerConnection::new(address.clone(), rating, sender.clone());
        if let Some(game_id) = self.registry.reconnect(player).await {
            info!(%address, game_id = %game_id, "Rebound to running game");
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
