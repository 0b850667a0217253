//! Session Runner
//!
//! One tokio task per game. It owns the [`GameSession`], pulls events off
//! the session queue one at a time and carries out the commands the
//! session emits. Timers and escrow calls run as detached tasks that post
//! their results back onto the same queue, so the session never blocks.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::core::GameId;

use super::{GameSession, SessionCommand, SessionError, SessionEvent, SessionRegistry, TimerKind};

/// Session queue depth.
const EVENT_QUEUE_SIZE: usize = 256;

/// Sending side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    game_id: GameId,
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Game this handle drives.
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// Queue an event for the session.
    pub async fn send(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SessionError::GameNotFound)
    }

    /// The runner has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Runner {
    game_id: GameId,
    events: mpsc::Sender<SessionEvent>,
    registry: Arc<SessionRegistry>,
    timers: BTreeMap<TimerKind, JoinHandle<()>>,
}

/// Start the runner task for `session`. Commands already queued on the
/// session (from joins made before spawning) are executed first.
pub fn spawn_session(mut session: GameSession, registry: Arc<SessionRegistry>) -> SessionHandle {
    let (tx, mut rx) = mpsc::channel::<SessionEvent>(EVENT_QUEUE_SIZE);
    let handle = SessionHandle {
        game_id: session.id().to_string(),
        tx: tx.clone(),
    };

    let mut runner = Runner {
        game_id: session.id().to_string(),
        events: tx,
        registry,
        timers: BTreeMap::new(),
    };

    tokio::spawn(async move {
        let initial = session.take_commands();
        let mut flow = runner.execute(&session, initial).await;

        while let Flow::Continue = flow {
            let Some(event) = rx.recv().await else {
                break;
            };
            let now = Instant::now().into_std();
            let step = AssertUnwindSafe(async {
                session.handle_event(event, now);
                let commands = session.take_commands();
                runner.execute(&session, commands).await
            })
            .catch_unwind()
            .await;

            flow = match step {
                Ok(flow) => flow,
                Err(panic) => {
                    error!(
                        game_id = %runner.game_id,
                        panic = %panic_message(panic.as_ref()),
                        "Session handler panicked, abandoning game"
                    );
                    runner.recover(&mut session).await
                }
            };
        }

        for (_, timer) in std::mem::take(&mut runner.timers) {
            timer.abort();
        }
        debug!(game_id = %runner.game_id, "Session runner stopped");
    });

    handle
}

impl Runner {
    /// Abandon the game after a handler panic. If that fails as well the
    /// session is dropped from the registry without further notice.
    async fn recover(&mut self, session: &mut GameSession) -> Flow {
        let now = Instant::now().into_std();
        let aborted = std::panic::catch_unwind(AssertUnwindSafe(|| {
            session.abort("internal_error", now);
            session.take_commands()
        }));
        match aborted {
            Ok(commands) => self.execute(session, commands).await,
            Err(_) => {
                error!(game_id = %self.game_id, "Session unrecoverable, evicting");
                self.registry
                    .remove_game(&self.game_id, &session.player_addresses())
                    .await;
                Flow::Stop
            }
        }
    }

    async fn execute(&mut self, session: &GameSession, commands: Vec<SessionCommand>) -> Flow {
        for command in commands {
            match command {
                SessionCommand::ScheduleTimer { kind, after, generation } => {
                    let tx = self.events.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(SessionEvent::Timer { kind, generation }).await;
                    });
                    if let Some(previous) = self.timers.insert(kind, timer) {
                        previous.abort();
                    }
                }

                SessionCommand::CreateEscrow { escrow_id, player_a, player_b, wager_amount } => {
                    let escrow = self.registry.escrow().clone();
                    let tx = self.events.clone();
                    tokio::spawn(async move {
                        let result = escrow
                            .create_escrow(&escrow_id, &player_a, &player_b, wager_amount)
                            .await;
                        let _ = tx.send(SessionEvent::EscrowCreated(result)).await;
                    });
                }

                SessionCommand::PollDeposits { escrow_id } => {
                    let escrow = self.registry.escrow().clone();
                    let tx = self.events.clone();
                    tokio::spawn(async move {
                        let result = escrow.query_escrow_status(&escrow_id).await;
                        let _ = tx.send(SessionEvent::DepositPolled(result)).await;
                    });
                }

                SessionCommand::Settle { escrow_id, winner, multiplier } => {
                    let escrow = self.registry.escrow().clone();
                    let tx = self.events.clone();
                    tokio::spawn(async move {
                        let result = escrow.settle(&escrow_id, &winner, multiplier).await;
                        let _ = tx
                            .send(SessionEvent::EscrowSettled { winner, multiplier, result })
                            .await;
                    });
                }

                SessionCommand::Cancel { escrow_id } => {
                    let escrow = self.registry.escrow().clone();
                    let tx = self.events.clone();
                    tokio::spawn(async move {
                        let result = escrow.cancel(&escrow_id).await;
                        let _ = tx.send(SessionEvent::EscrowCancelled(result)).await;
                    });
                }

                SessionCommand::NextGame { match_id, white, black, wager_amount, escrow_id } => {
                    let next = self
                        .registry
                        .start_next_game(match_id, white, black, wager_amount, escrow_id)
                        .await;
                    info!(game_id = %self.game_id, next_game = %next, "Match continues");
                }

                SessionCommand::Evict => {
                    self.registry
                        .remove_game(&self.game_id, &session.player_addresses())
                        .await;
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::{EscrowClient, EscrowConfig, EscrowCoordinator, EscrowMode, EscrowStatus};
    use crate::game::{Board, Color, GameOutcome, Move, RulesEngine, StandardRules};
    use crate::network::protocol::{ClientMessage, GameStatus, ServerMessage};
    use crate::session::{MatchManager, PlayerConnection, SessionConfig, SessionContext};
    use std::sync::Mutex;
    use std::time::Duration;

    fn registry(config: SessionConfig, escrow: EscrowCoordinator) -> Arc<SessionRegistry> {
        registry_with_rules(config, escrow, Arc::new(StandardRules))
    }

    fn registry_with_rules(
        config: SessionConfig,
        escrow: EscrowCoordinator,
        rules: Arc<dyn RulesEngine>,
    ) -> Arc<SessionRegistry> {
        let ctx = SessionContext::new(config, rules, Arc::new(Mutex::new(MatchManager::new())));
        Arc::new(SessionRegistry::new(ctx, Arc::new(escrow)))
    }

    /// Standard rules that blow up as soon as moves are generated.
    struct BrokenRules;

    impl RulesEngine for BrokenRules {
        fn initial_board(&self) -> Board {
            StandardRules.initial_board()
        }

        fn legal_moves(&self, _board: &Board, _dice: &[u8], _player: Color) -> Vec<Move> {
            panic!("move generator exploded")
        }

        fn apply_move(&self, board: &Board, player: Color, mv: &Move) -> Board {
            StandardRules.apply_move(board, player, mv)
        }

        fn check_win(&self, board: &Board) -> Option<GameOutcome> {
            StandardRules.check_win(board)
        }
    }

    fn memory_escrow() -> EscrowCoordinator {
        let config = EscrowConfig {
            mode: EscrowMode::Memory,
            ..EscrowConfig::default()
        };
        let client = EscrowClient::from_config(&config).unwrap();
        EscrowCoordinator::new(client, &config)
    }

    fn player(address: &str) -> (PlayerConnection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(512);
        (PlayerConnection::new(address.into(), 1500, tx), rx)
    }

    async fn wait_for<F>(rx: &mut mpsc::Receiver<ServerMessage>, pred: F) -> ServerMessage
    where
        F: Fn(&ServerMessage) -> bool,
    {
        loop {
            let msg = rx.recv().await.expect("channel closed");
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_expiry_fires_through_runner() {
        let reg = registry(SessionConfig::default(), EscrowCoordinator::unconfigured());
        let (white, mut white_rx) = player("xion1white");
        let (black, _black_rx) = player("xion1black");

        let game_id = reg.create_game(white, 0, 1).await.unwrap();
        assert_eq!(reg.join_game(&game_id, black).await, Ok(Color::Black));

        // White never acts; the auto-roll fires, then the clock runs out.
        let over = wait_for(&mut white_rx, |m| matches!(m, ServerMessage::GameOver { .. })).await;
        match over {
            ServerMessage::GameOver { winner, .. } => assert_eq!(winner, Color::Black),
            _ => unreachable!(),
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(reg.handle(&game_id).await.is_none());
        assert_eq!(reg.player_game("xion1white").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wagered_game_settles_in_memory() {
        let reg = registry(SessionConfig::default(), memory_escrow());
        let (white, mut white_rx) = player("xion1white");
        let (black, _black_rx) = player("xion1black");

        let game_id = reg.create_game(white, 100, 1).await.unwrap();
        reg.join_game(&game_id, black).await.unwrap();

        wait_for(&mut white_rx, |m| matches!(m, ServerMessage::EscrowActive { .. })).await;
        let start = wait_for(&mut white_rx, |m| matches!(m, ServerMessage::GameStart { .. })).await;
        if let ServerMessage::GameStart { game_state, .. } = start {
            assert_eq!(game_state.status, GameStatus::Playing);
            assert_eq!(game_state.escrow_status, EscrowStatus::Active);
        }

        let (reply, _reply_rx) = mpsc::channel(8);
        reg.route(
            "xion1black",
            reply.clone(),
            ClientMessage::Resign {
                game_id: game_id.clone(),
                resign_type: crate::game::ResultType::Gammon,
            },
        )
        .await
        .unwrap();
        reg.route("xion1white", reply, ClientMessage::AcceptResign { game_id: game_id.clone() })
            .await
            .unwrap();

        let settled =
            wait_for(&mut white_rx, |m| matches!(m, ServerMessage::EscrowSettled { .. })).await;
        match settled {
            ServerMessage::EscrowSettled { winner, multiplier, .. } => {
                assert_eq!(winner, "xion1white");
                assert_eq!(multiplier, 2);
            }
            _ => unreachable!(),
        }
        // Stake back plus a doubled wager.
        assert_eq!(reg.escrow().query_balance("xion1white").await.unwrap(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_grace_through_runner() {
        let reg = registry(SessionConfig::default(), EscrowCoordinator::unconfigured());
        let (white, mut white_rx) = player("xion1white");
        let (black, _black_rx) = player("xion1black");

        let game_id = reg.create_game(white, 0, 1).await.unwrap();
        reg.join_game(&game_id, black).await.unwrap();
        reg.disconnect("xion1black").await;

        let countdown =
            wait_for(&mut white_rx, |m| matches!(m, ServerMessage::DisconnectCountdown { .. })).await;
        if let ServerMessage::DisconnectCountdown { seconds_remaining, .. } = countdown {
            assert_eq!(seconds_remaining, 25);
        }

        let abandoned =
            wait_for(&mut white_rx, |m| matches!(m, ServerMessage::GameAbandoned { .. })).await;
        match abandoned {
            ServerMessage::GameAbandoned { winner, .. } => {
                assert_eq!(winner.as_deref(), Some("xion1white"))
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_panic_abandons_game() {
        let reg = registry_with_rules(
            SessionConfig::default(),
            EscrowCoordinator::unconfigured(),
            Arc::new(BrokenRules),
        );
        let (white, mut white_rx) = player("xion1white");
        let (black, mut black_rx) = player("xion1black");

        let game_id = reg.create_game(white, 0, 1).await.unwrap();
        reg.join_game(&game_id, black).await.unwrap();
        wait_for(&mut white_rx, |m| matches!(m, ServerMessage::GameStart { .. })).await;

        let (reply, _reply_rx) = mpsc::channel(8);
        reg.route("xion1white", reply, ClientMessage::RollDice { game_id: game_id.clone() })
            .await
            .unwrap();

        let abandoned =
            wait_for(&mut black_rx, |m| matches!(m, ServerMessage::GameAbandoned { .. })).await;
        match abandoned {
            ServerMessage::GameAbandoned { winner, reason, .. } => {
                assert_eq!(winner, None);
                assert_eq!(reason, "internal_error");
            }
            _ => unreachable!(),
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(reg.handle(&game_id).await.is_none());
        assert_eq!(reg.player_game("xion1black").await, None);
    }
}
