//! Wager Escrow
//!
//! Coordinates the on-chain escrow that holds both players' stakes:
//!
//! ```text
//! create_escrow ──► pending_deposits ──► active ──► settled
//!                          │                │
//!                          └──── cancel ────┴──► cancelled
//! ```
//!
//! The contract is reached through an [`EscrowBackend`]: [`HttpEscrowBackend`]
//! for a real chain, [`InMemoryEscrowBackend`] for development and tests.

pub mod coordinator;
pub mod http;
pub mod memory;
pub mod status;

pub use coordinator::{EscrowBackend, EscrowClient, EscrowCoordinator};
pub use http::HttpEscrowBackend;
pub use memory::InMemoryEscrowBackend;
pub use status::{settlement_multiplier, EscrowInfo, EscrowStatus};

/// USDC on XION.
pub const DEFAULT_DENOM: &str =
    "ibc/6490A7EAB61059BFC1CDDEB05917DD70BDF3A611654162A1A47DB930D40D8AF4";

/// Escrow failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscrowError {
    /// No escrow backend configured.
    #[error("Escrow is not configured")]
    NotConfigured,

    /// Network or node failure; safe to retry.
    #[error("Escrow transport error: {0}")]
    Transport(String),

    /// Contract rejected the message.
    #[error("Escrow contract error: {0}")]
    Contract(String),

    /// Response did not have the expected shape.
    #[error("Escrow response decode error: {0}")]
    Decode(String),
}

impl EscrowError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EscrowError::Transport(_))
    }
}

/// Which escrow backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscrowMode {
    /// No escrow; wagered games fall back or abandon per session policy.
    #[default]
    Disabled,
    /// In-process ledger with automatic deposits.
    Memory,
    /// Chain contract over HTTP.
    Http,
}

/// Escrow configuration.
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Backend selection.
    pub mode: EscrowMode,
    /// LCD endpoint for queries.
    pub lcd_url: Option<String>,
    /// Signing relay for execute messages.
    pub signer_url: Option<String>,
    /// Escrow contract address.
    pub contract_address: Option<String>,
    /// Bearer key for the signing relay.
    pub admin_key: Option<String>,
    /// Wager denomination.
    pub denom: String,
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Initial retry delay, doubled per attempt.
    pub backoff_ms: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_ms: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            mode: EscrowMode::Disabled,
            lcd_url: None,
            signer_url: None,
            contract_address: None,
            admin_key: None,
            denom: DEFAULT_DENOM.to_string(),
            max_attempts: 3,
            backoff_ms: 500,
            request_timeout_ms: 10_000,
        }
    }
}

impl EscrowConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let mode = match var("ESCROW_MODE").as_deref() {
            Some("http") => EscrowMode::Http,
            Some("memory") => EscrowMode::Memory,
            _ => EscrowMode::Disabled,
        };

        Self {
            mode,
            lcd_url: var("XION_LCD_URL"),
            signer_url: var("ESCROW_SIGNER_URL"),
            contract_address: var("ESCROW_CONTRACT_ADDRESS"),
            admin_key: var("ESCROW_ADMIN_KEY"),
            denom: var("ESCROW_DENOM").unwrap_or(defaults.denom),
            max_attempts: var("ESCROW_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_attempts),
            backoff_ms: var("ESCROW_BACKOFF_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.backoff_ms),
            request_timeout_ms: var("ESCROW_TIMEOUT_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(|ms| ms.max(1))
                .unwrap_or(defaults.request_timeout_ms),
        }
    }
}
