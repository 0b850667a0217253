//! Core primitives shared by every layer: hashing and identifiers.

pub mod hash;
pub mod ids;

pub use hash::{hash_bytes, hash_hex, random_seed_hex, ConcatHasher, Digest32};
pub use ids::{Address, GameId, MatchId};
