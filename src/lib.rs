//! # Backgammon Server
//!
//! Authoritative server for real-time, wagered, two-player backgammon.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BACKGAMMON SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Hashing and identifiers                   │
//! │  ├── hash.rs     - SHA-256 helpers, seeds                    │
//! │  └── ids.rs      - Game codes and match ids                  │
//! │                                                              │
//! │  game/           - Rules engine (pure)                       │
//! │  ├── types.rs    - Board, colors, moves, results             │
//! │  ├── board.rs    - Checker layout and pip counts             │
//! │  ├── moves.rs    - Legal move generation                     │
//! │  └── rules.rs    - RulesEngine trait, cube limits            │
//! │                                                              │
//! │  fairness/       - Commit-reveal dice                        │
//! │                                                              │
//! │  session/        - Game sessions                             │
//! │  ├── game.rs     - Per-game state machine                    │
//! │  ├── clock.rs    - Bronstein clock                           │
//! │  ├── runner.rs   - Serialized event loop per game            │
//! │  ├── registry.rs - Live games and seated players             │
//! │  ├── matchmaker.rs - Rating-band pairing                     │
//! │  └── match_manager.rs - Points matches, Crawford rule        │
//! │                                                              │
//! │  escrow/         - On-chain wager escrow                     │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - Token validation, nonce challenge         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! Clients are untrusted. Every action is validated against server state
//! and the result is re-broadcast from that state. Dice come from a
//! server seed committed before the roll and mixed with a client seed,
//! so either player can verify every roll after the game.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod escrow;
pub mod fairness;
pub mod game;
pub mod network;
pub mod session;

// Re-export commonly used types
pub use config::ServerConfig;
pub use game::{Board, Color, Move, ResultType, RulesEngine, StandardRules};
pub use session::{GameSession, SessionConfig, SessionRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
