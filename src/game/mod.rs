//! Game Logic Module
//!
//! Backgammon rules as pure functions. No I/O, no clocks, no randomness;
//! dice arrive from the fairness layer.
//!
//! ## Module Structure
//!
//! - `types`: Board, colors, moves, result types
//! - `board`: Board queries and single-checker mutation
//! - `moves`: Legal move sequence generation
//! - `rules`: `RulesEngine` trait and `StandardRules`

pub mod types;
pub mod board;
pub mod moves;
pub mod rules;

// Re-export key types
pub use types::{Board, Color, GameOutcome, Move, ResultType};
pub use moves::{format_move, generate_all_sequences, legal_first_moves};
pub use rules::{expand_dice, RulesEngine, RulesError, StandardRules, MAX_CUBE_VALUE};
