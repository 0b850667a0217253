//! Network Layer
//!
//! WebSocket server, wire protocol and authentication. Game rules and
//! session state live in `game/` and `session/`; this layer only parses,
//! authenticates and routes.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, AuthOutcome, NonceStore, TokenClaims};
pub use protocol::{ClientMessage, ErrorCode, GameSnapshot, GameStatus, ServerMessage};
pub use server::{GameServer, GameServerError};
