//! Escrow Coordinator
//!
//! Async boundary to the wager-escrow contract. The transport lives
//! behind [`EscrowBackend`]; the coordinator builds contract messages,
//! retries transient failures with exponential backoff, and normalizes
//! everything that comes back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::status::EscrowInfo;
use super::{EscrowConfig, EscrowError, EscrowMode, HttpEscrowBackend, InMemoryEscrowBackend};

// =============================================================================
// Backend
// =============================================================================

/// Transport to the escrow contract.
#[async_trait]
pub trait EscrowBackend: Send + Sync {
    /// Sign and broadcast an execute message.
    async fn execute(&self, msg: Value) -> Result<Value, EscrowError>;

    /// Run a read-only smart query.
    async fn query(&self, msg: Value) -> Result<Value, EscrowError>;

    /// Bank balance of `address` in `denom`.
    async fn balance(&self, address: &str, denom: &str) -> Result<u64, EscrowError>;
}

/// Escrow client handle: either absent or ready to use.
#[derive(Clone, Default)]
pub enum EscrowClient {
    /// No escrow configured. Every call fails with `NotConfigured`.
    #[default]
    Unconfigured,
    /// Live backend.
    Ready(Arc<dyn EscrowBackend>),
}

impl EscrowClient {
    /// Build the client described by `config`.
    pub fn from_config(config: &EscrowConfig) -> Result<Self, EscrowError> {
        match config.mode {
            EscrowMode::Disabled => Ok(EscrowClient::Unconfigured),
            EscrowMode::Memory => Ok(EscrowClient::Ready(Arc::new(
                InMemoryEscrowBackend::new(true),
            ))),
            EscrowMode::Http => {
                let backend = HttpEscrowBackend::from_config(config)?;
                Ok(EscrowClient::Ready(Arc::new(backend)))
            }
        }
    }

    fn backend(&self) -> Result<&Arc<dyn EscrowBackend>, EscrowError> {
        match self {
            EscrowClient::Unconfigured => Err(EscrowError::NotConfigured),
            EscrowClient::Ready(backend) => Ok(backend),
        }
    }
}

impl std::fmt::Debug for EscrowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscrowClient::Unconfigured => f.write_str("EscrowClient::Unconfigured"),
            EscrowClient::Ready(_) => f.write_str("EscrowClient::Ready"),
        }
    }
}

// =============================================================================
// Contract Messages
// =============================================================================

/// `create_escrow` execute message.
pub fn create_escrow_msg(
    game_id: &str,
    player_a: &str,
    player_b: &str,
    wager_amount: u64,
    denom: &str,
) -> Value {
    json!({
        "create_escrow": {
            "game_id": game_id,
            "player_a": player_a,
            "player_b": player_b,
            "wager_amount": wager_amount.to_string(),
            "denom": denom,
        }
    })
}

/// Settlement message; multipliers above 1 use `settle_with_multiplier`.
pub fn settle_msg(game_id: &str, winner: &str, multiplier: u32) -> Value {
    if multiplier > 1 {
        json!({
            "settle_with_multiplier": {
                "game_id": game_id,
                "winner": winner,
                "multiplier": multiplier.to_string(),
            }
        })
    } else {
        json!({ "settle": { "game_id": game_id, "winner": winner } })
    }
}

/// `cancel` execute message.
pub fn cancel_msg(game_id: &str) -> Value {
    json!({ "cancel": { "game_id": game_id } })
}

/// `escrow` smart query.
pub fn escrow_query(game_id: &str) -> Value {
    json!({ "escrow": { "game_id": game_id } })
}

// =============================================================================
// Coordinator
// =============================================================================

/// Retrying front-end over an [`EscrowClient`].
#[derive(Debug, Clone)]
pub struct EscrowCoordinator {
    client: EscrowClient,
    denom: String,
    max_attempts: u32,
    backoff: Duration,
}

impl EscrowCoordinator {
    /// Wrap `client` using the retry and denom settings in `config`.
    pub fn new(client: EscrowClient, config: &EscrowConfig) -> Self {
        Self {
            client,
            denom: config.denom.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Coordinator with no backend.
    pub fn unconfigured() -> Self {
        Self::new(EscrowClient::Unconfigured, &EscrowConfig::default())
    }

    /// Whether a backend is present.
    pub fn is_configured(&self) -> bool {
        matches!(self.client, EscrowClient::Ready(_))
    }

    /// Token denomination wagers are held in.
    pub fn denom(&self) -> &str {
        &self.denom
    }

    /// Open an escrow for `game_id` between two players.
    pub async fn create_escrow(
        &self,
        game_id: &str,
        player_a: &str,
        player_b: &str,
        wager_amount: u64,
    ) -> Result<(), EscrowError> {
        let msg = create_escrow_msg(game_id, player_a, player_b, wager_amount, &self.denom);
        let result = self.execute_with_retry(game_id, msg).await;
        match &result {
            Ok(_) => info!(game_id, wager_amount, "Escrow created"),
            Err(e) => warn!(game_id, error = %e, "Escrow creation failed"),
        }
        result.map(|_| ())
    }

    /// Poll the contract for the current escrow state.
    pub async fn query_escrow_status(&self, game_id: &str) -> Result<EscrowInfo, EscrowError> {
        let backend = self.client.backend()?;
        let query = escrow_query(game_id);
        let mut attempt = 1;
        let raw = loop {
            match backend.query(query.clone()).await {
                Ok(raw) => break raw,
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    debug!(game_id, attempt, error = %e, "Escrow query retry");
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(game_id, error = %e, "Escrow query failed");
                    return Err(e);
                }
            }
        };
        let info = EscrowInfo::from_contract(&raw)
            .ok_or_else(|| EscrowError::Decode(format!("unexpected escrow response: {}", raw)))?;
        debug!(game_id, status = ?info.status, "Escrow status");
        Ok(info)
    }

    /// Pay out to `winner` with the given stake multiplier.
    pub async fn settle(&self, game_id: &str, winner: &str, multiplier: u32) -> Result<(), EscrowError> {
        let result = self
            .execute_with_retry(game_id, settle_msg(game_id, winner, multiplier))
            .await;
        match &result {
            Ok(_) => info!(game_id, winner, multiplier, "Escrow settled"),
            Err(e) => warn!(game_id, winner, error = %e, "Escrow settlement failed"),
        }
        result.map(|_| ())
    }

    /// Refund both deposits.
    pub async fn cancel(&self, game_id: &str) -> Result<(), EscrowError> {
        let result = self.execute_with_retry(game_id, cancel_msg(game_id)).await;
        match &result {
            Ok(_) => info!(game_id, "Escrow cancelled"),
            Err(e) => warn!(game_id, error = %e, "Escrow cancel failed"),
        }
        result.map(|_| ())
    }

    /// Wallet balance in the wager denom.
    pub async fn query_balance(&self, address: &str) -> Result<u64, EscrowError> {
        let backend = self.client.backend()?;
        backend.balance(address, &self.denom).await
    }

    async fn execute_with_retry(&self, game_id: &str, msg: Value) -> Result<Value, EscrowError> {
        let backend = self.client.backend()?;
        let mut attempt = 1;
        loop {
            match backend.execute(msg.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    debug!(game_id, attempt, error = %e, "Escrow execute retry");
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        failures_left: AtomicU32,
        calls: AtomicU32,
        permanent: bool,
    }

    impl FlakyBackend {
        fn new(failures: u32, permanent: bool) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                permanent,
            }
        }

        fn fail(&self) -> Option<EscrowError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left == 0 {
                return None;
            }
            self.failures_left.store(left - 1, Ordering::SeqCst);
            Some(if self.permanent {
                EscrowError::Contract("unauthorized".into())
            } else {
                EscrowError::Transport("connection reset".into())
            })
        }
    }

    #[async_trait]
    impl EscrowBackend for FlakyBackend {
        async fn execute(&self, _msg: Value) -> Result<Value, EscrowError> {
            match self.fail() {
                Some(e) => Err(e),
                None => Ok(json!({})),
            }
        }

        async fn query(&self, msg: Value) -> Result<Value, EscrowError> {
            if let Some(e) = self.fail() {
                return Err(e);
            }
            Ok(json!({
                "game_id": msg["escrow"]["game_id"],
                "status": "active",
                "player_a_deposited": true,
                "player_b_deposited": true
            }))
        }

        async fn balance(&self, _address: &str, _denom: &str) -> Result<u64, EscrowError> {
            Ok(42)
        }
    }

    fn coordinator(backend: Arc<FlakyBackend>) -> EscrowCoordinator {
        let config = EscrowConfig {
            backoff_ms: 10,
            ..EscrowConfig::default()
        };
        EscrowCoordinator::new(EscrowClient::Ready(backend), &config)
    }

    #[test]
    fn test_settle_message_shape() {
        let plain = settle_msg("g", "xion1w", 1);
        assert!(plain.get("settle").is_some());

        let multi = settle_msg("g", "xion1w", 8);
        assert_eq!(multi["settle_with_multiplier"]["multiplier"], "8");
        assert_eq!(multi["settle_with_multiplier"]["winner"], "xion1w");
    }

    #[test]
    fn test_create_message_amount_is_string() {
        let msg = create_escrow_msg("g", "a", "b", 1_000_000, "uxion");
        assert_eq!(msg["create_escrow"]["wager_amount"], "1000000");
        assert_eq!(msg["create_escrow"]["denom"], "uxion");
    }

    #[tokio::test]
    async fn test_unconfigured_reports_not_configured() {
        let coord = EscrowCoordinator::unconfigured();
        assert!(!coord.is_configured());
        assert_eq!(coord.cancel("g").await, Err(EscrowError::NotConfigured));
        assert_eq!(
            coord.query_escrow_status("g").await.unwrap_err(),
            EscrowError::NotConfigured
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let backend = Arc::new(FlakyBackend::new(2, false));
        let coord = coordinator(backend.clone());
        assert!(coord.settle("g", "xion1w", 2).await.is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let backend = Arc::new(FlakyBackend::new(10, false));
        let coord = coordinator(backend.clone());
        assert!(matches!(
            coord.create_escrow("g", "a", "b", 5).await,
            Err(EscrowError::Transport(_))
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_contract_errors_not_retried() {
        let backend = Arc::new(FlakyBackend::new(1, true));
        let coord = coordinator(backend.clone());
        assert!(matches!(coord.cancel("g").await, Err(EscrowError::Contract(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_normalizes() {
        let backend = Arc::new(FlakyBackend::new(1, false));
        let coord = coordinator(backend);
        let info = coord.query_escrow_status("m-9").await.unwrap();
        assert_eq!(info.game_id, "m-9");
        assert!(info.fully_funded());
        assert_eq!(coord.query_balance("xion1a").await.unwrap(), 42);
    }
}
