//! Server Configuration
//!
//! Everything is read from environment variables at startup; each section
//! has its own `from_env` and falls back to its `Default`.

use std::net::SocketAddr;

use crate::escrow::EscrowConfig;
use crate::network::auth::AuthConfig;
use crate::session::{MatchmakingConfig, SessionConfig};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3001;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Server version string.
    pub version: String,
    /// Game timing and policy.
    pub session: SessionConfig,
    /// Matchmaking queue.
    pub matchmaking: MatchmakingConfig,
    /// Escrow backend.
    pub escrow: EscrowConfig,
    /// Token validation.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            version: env!("CARGO_PKG_VERSION").to_string(),
            session: SessionConfig::default(),
            matchmaking: MatchmakingConfig::default(),
            escrow: EscrowConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: parse_bind_addr(std::env::var("BIND_ADDR").ok().as_deref())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            version: defaults.version,
            session: SessionConfig::from_env(),
            matchmaking: MatchmakingConfig::from_env(),
            escrow: EscrowConfig::from_env(),
            auth: AuthConfig::from_env(),
        }
    }
}

/// Accept either `host:port` or a bare port.
fn parse_bind_addr(value: Option<&str>) -> Option<SocketAddr> {
    let value = value?.trim();
    if let Ok(port) = value.parse::<u16>() {
        return Some(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 3001);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.matchmaking.rating_range, 200);
        assert!(!config.auth.skip_verification);
    }

    #[test]
    fn test_parse_bind_addr() {
        assert_eq!(
            parse_bind_addr(Some("127.0.0.1:9000")),
            Some("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(parse_bind_addr(Some("4000")).map(|a| a.port()), Some(4000));
        assert_eq!(parse_bind_addr(Some("nonsense")), None);
        assert_eq!(parse_bind_addr(None), None);
    }
}
