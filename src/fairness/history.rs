//! Per-Game Dice Ledger
//!
//! One commit per turn, revealed at most once. The revealed history is
//! sent with `game_over` so players can audit every roll.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::commit::{create_commit, derive_dice, Dice, DiceReveal};
use super::FairnessError;

/// Stored commit for one turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiceCommit {
    /// Secret seed, disclosed on reveal.
    pub server_seed: String,
    /// Published hash of `server_seed`.
    pub commit_hash: String,
    /// Seed mixed in at reveal time.
    pub client_seed: Option<String>,
    /// Turn this commit belongs to.
    pub turn_number: u32,
    /// Set exactly once.
    pub dice: Option<Dice>,
}

/// Ledger of dice commits for a single game.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiceHistory {
    commits: BTreeMap<u32, DiceCommit>,
}

impl DiceHistory {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a fresh server seed for `turn_number` and return its hash.
    pub fn create_turn_commit(&mut self, turn_number: u32) -> Result<String, FairnessError> {
        if self.commits.contains_key(&turn_number) {
            return Err(FairnessError::AlreadyCommitted(turn_number));
        }
        let c = create_commit();
        let hash = c.commit_hash.clone();
        self.commits.insert(
            turn_number,
            DiceCommit {
                server_seed: c.server_seed,
                commit_hash: c.commit_hash,
                client_seed: None,
                turn_number,
                dice: None,
            },
        );
        Ok(hash)
    }

    /// Reveal the dice for `turn_number`, mixing in `client_seed`.
    ///
    /// Fails without touching the ledger if the turn has no commit or was
    /// already revealed.
    pub fn reveal_dice(
        &mut self,
        turn_number: u32,
        client_seed: &str,
    ) -> Result<DiceReveal, FairnessError> {
        let commit = self
            .commits
            .get_mut(&turn_number)
            .ok_or(FairnessError::NoCommit(turn_number))?;
        if commit.dice.is_some() {
            return Err(FairnessError::AlreadyRevealed(turn_number));
        }

        let dice = derive_dice(&commit.server_seed, client_seed, turn_number);
        commit.client_seed = Some(client_seed.to_string());
        commit.dice = Some(dice);

        Ok(DiceReveal {
            dice,
            server_seed: commit.server_seed.clone(),
            commit_hash: commit.commit_hash.clone(),
            client_seed: client_seed.to_string(),
            turn_number,
        })
    }

    /// Published hash for a turn, if committed.
    pub fn commit_hash(&self, turn_number: u32) -> Option<&str> {
        self.commits.get(&turn_number).map(|c| c.commit_hash.as_str())
    }

    /// Whether the turn's dice have been revealed.
    pub fn is_revealed(&self, turn_number: u32) -> bool {
        self.commits
            .get(&turn_number)
            .map_or(false, |c| c.dice.is_some())
    }

    /// All revealed turns, ordered by turn number.
    pub fn history(&self) -> Vec<DiceReveal> {
        self.commits
            .values()
            .filter_map(|c| {
                Some(DiceReveal {
                    dice: c.dice?,
                    server_seed: c.server_seed.clone(),
                    commit_hash: c.commit_hash.clone(),
                    client_seed: c.client_seed.clone().unwrap_or_default(),
                    turn_number: c.turn_number,
                })
            })
            .collect()
    }

    /// Serialize the ledger using bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a ledger from bincode bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
