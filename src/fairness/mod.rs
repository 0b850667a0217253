//! Provably Fair Dice
//!
//! Commit-reveal dice: neither the server nor a client can bias a roll,
//! and anyone holding the revealed seeds can recompute it.

pub mod commit;
pub mod history;

pub use commit::{create_commit, derive_dice, verify_dice, Commitment, Dice, DiceReveal};
pub use history::{DiceCommit, DiceHistory};

/// Fairness protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FairnessError {
    /// Reveal requested for a turn that was never committed.
    #[error("No dice commit for turn {0}")]
    NoCommit(u32),

    /// Reveal requested twice.
    #[error("Dice for turn {0} already revealed")]
    AlreadyRevealed(u32),

    /// Commit requested twice.
    #[error("Turn {0} already has a dice commit")]
    AlreadyCommitted(u32),
}
