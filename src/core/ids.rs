//! Identifier generation for games and matches.

use rand::Rng;

/// Short numeric game code shown to players.
pub type GameId = String;

/// Match identifier (UUID string).
pub type MatchId = String;

/// Verified wallet address of a player.
pub type Address = String;

/// Attempts at a collision-free 4-digit code before falling back.
const SHORT_ID_ATTEMPTS: usize = 100;

/// Generate a 4-digit game code not rejected by `taken`.
///
/// Falls back to appending a millisecond fragment when the code space
/// is crowded.
pub fn generate_short_id<F>(taken: F) -> GameId
where
    F: Fn(&str) -> bool,
{
    let mut rng = rand::thread_rng();
    for _ in 0..SHORT_ID_ATTEMPTS {
        let id = rng.gen_range(1000..10000u32).to_string();
        if !taken(&id) {
            return id;
        }
    }
    let suffix = chrono::Utc::now().timestamp_millis().rem_euclid(1000);
    format!("{}{:03}", rng.gen_range(1000..10000u32), suffix)
}

/// Generate a fresh match identifier.
pub fn generate_match_id() -> MatchId {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_is_four_digits() {
        let id = generate_short_id(|_| false);
        assert_eq!(id.len(), 4);
        assert!(id.parse::<u32>().unwrap() >= 1000);
    }

    #[test]
    fn test_short_id_fallback_when_crowded() {
        let id = generate_short_id(|_| true);
        assert_eq!(id.len(), 7);
    }

    #[test]
    fn test_match_ids_unique() {
        assert_ne!(generate_match_id(), generate_match_id());
    }
}
