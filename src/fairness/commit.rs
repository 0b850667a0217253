//! Dice Commit-Reveal Primitives
//!
//! The server publishes `SHA256(server_seed)` before a client seed is
//! known, then derives the dice from both seeds and the turn number:
//!
//! ```text
//! commit_hash = hex(SHA256(server_seed))
//! h           = SHA256(server_seed ‖ client_seed ‖ decimal(turn_number))
//! dice        = [h[0] % 6 + 1, h[1] % 6 + 1]
//! ```
//!
//! Seeds are hex strings and are hashed as their UTF-8 text, so any
//! observer can recompute everything with a stock SHA-256 tool.

use serde::{Deserialize, Serialize};

use crate::core::hash::{digests_equal, hash_hex, random_seed_hex, ConcatHasher};

/// A pair of dice.
pub type Dice = [u8; 2];

/// Freshly generated server seed and its public commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commitment {
    /// Secret until reveal.
    pub server_seed: String,
    /// Published immediately.
    pub commit_hash: String,
}

/// Data broadcast when a turn's dice are revealed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceReveal {
    /// Derived dice.
    pub dice: Dice,
    /// The now-public server seed.
    pub server_seed: String,
    /// Commitment published before the roll.
    pub commit_hash: String,
    /// Seed that was mixed in (client-supplied or server fallback).
    pub client_seed: String,
    /// Turn the dice belong to.
    pub turn_number: u32,
}

/// Generate a 256-bit server seed and commit to it.
pub fn create_commit() -> Commitment {
    let server_seed = random_seed_hex();
    let commit_hash = hash_hex(&server_seed);
    Commitment { server_seed, commit_hash }
}

/// Deterministically derive dice from both seeds and the turn number.
pub fn derive_dice(server_seed: &str, client_seed: &str, turn_number: u32) -> Dice {
    let mut hasher = ConcatHasher::new();
    hasher
        .update_str(server_seed)
        .update_str(client_seed)
        .update_str(&turn_number.to_string());
    let h = hasher.finalize();
    [h[0] % 6 + 1, h[1] % 6 + 1]
}

/// Check a revealed roll against its commitment.
///
/// True only when the server seed hashes to `commit_hash` and the
/// derived dice equal `dice`.
pub fn verify_dice(
    commit_hash: &str,
    server_seed: &str,
    client_seed: &str,
    turn_number: u32,
    dice: Dice,
) -> bool {
    if !digests_equal(&hash_hex(server_seed), commit_hash) {
        return false;
    }
    derive_dice(server_seed, client_seed, turn_number) == dice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::hash_bytes;
    use proptest::prelude::*;

    #[test]
    fn test_commit_is_hash_of_seed() {
        let c = create_commit();
        assert_eq!(c.commit_hash, hash_hex(&c.server_seed));
        assert_eq!(c.server_seed.len(), 64);
    }

    #[test]
    fn test_dice_mapping_matches_hash_bytes() {
        let seed = "00".repeat(32);
        let h = hash_bytes(format!("{}abc1", seed).as_bytes());
        let dice = derive_dice(&seed, "abc", 1);
        assert_eq!(dice, [h[0] % 6 + 1, h[1] % 6 + 1]);
    }

    #[test]
    fn test_verify_roundtrip() {
        let c = create_commit();
        let dice = derive_dice(&c.server_seed, "client", 3);
        assert!(verify_dice(&c.commit_hash, &c.server_seed, "client", 3, dice));
        assert!(verify_dice(&c.commit_hash.to_uppercase(), &c.server_seed, "client", 3, dice));
    }

    #[test]
    fn test_verify_rejects_wrong_commit() {
        let a = create_commit();
        let b = create_commit();
        let dice = derive_dice(&a.server_seed, "", 1);
        assert!(!verify_dice(&b.commit_hash, &a.server_seed, "", 1, dice));
    }

    proptest! {
        #[test]
        fn prop_dice_deterministic_and_in_range(
            server in "[0-9a-f]{64}",
            client in ".{0,40}",
            turn in 0u32..10_000,
        ) {
            let a = derive_dice(&server, &client, turn);
            let b = derive_dice(&server, &client, turn);
            prop_assert_eq!(a, b);
            prop_assert!((1..=6).contains(&a[0]));
            prop_assert!((1..=6).contains(&a[1]));
        }

        #[test]
        fn prop_mutated_dice_fail(
            server in "[0-9a-f]{64}",
            client in "[a-z]{0,16}",
            turn in 1u32..500,
            which in 0usize..2,
            delta in 1u8..6,
        ) {
            let commit = hash_hex(&server);
            let mut dice = derive_dice(&server, &client, turn);
            prop_assert!(verify_dice(&commit, &server, &client, turn, dice));
            dice[which] = (dice[which] - 1 + delta) % 6 + 1;
            prop_assert!(!verify_dice(&commit, &server, &client, turn, dice));
        }

        #[test]
        fn prop_mutated_server_seed_fails(
            server in "[0-9a-f]{64}",
            client in "[a-z]{0,16}",
            turn in 1u32..500,
            pos in 0usize..64,
        ) {
            let commit = hash_hex(&server);
            let dice = derive_dice(&server, &client, turn);
            let mut bytes = server.clone().into_bytes();
            bytes[pos] ^= 0x01;
            let mutated = String::from_utf8(bytes).unwrap();
            prop_assert!(!verify_dice(&commit, &mutated, &client, turn, dice));
        }

        #[test]
        fn prop_other_inputs_verify_only_if_dice_match(
            server in "[0-9a-f]{64}",
            client in "[a-z]{1,16}",
            turn in 1u32..500,
        ) {
            let commit = hash_hex(&server);
            let dice = derive_dice(&server, &client, turn);
            let other_turn = turn + 1;
            prop_assert_eq!(
                verify_dice(&commit, &server, &client, other_turn, dice),
                derive_dice(&server, &client, other_turn) == dice
            );
            let other_client = format!("{}x", client);
            prop_assert_eq!(
                verify_dice(&commit, &server, &other_client, turn, dice),
                derive_dice(&server, &other_client, turn) == dice
            );
        }
    }
}
