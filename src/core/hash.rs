//! Hashing Helpers
//!
//! SHA-256 primitives shared by the dice commitment protocol and
//! identity derivation. Seeds and digests travel over the wire as
//! lowercase hex strings, so most helpers speak hex.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Hash output type (256 bits / 32 bytes).
pub type Digest32 = [u8; 32];

/// Number of random bytes in a freshly generated seed.
pub const SEED_BYTES: usize = 32;

/// Incremental hasher over a sequence of byte slices.
///
/// Parts are concatenated without separators, which keeps digests
/// reproducible by any observer that concatenates the same strings.
pub struct ConcatHasher {
    hasher: Sha256,
}

impl ConcatHasher {
    /// Create an empty hasher.
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    /// Append raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    /// Append a UTF-8 string.
    #[inline]
    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.update_bytes(s.as_bytes())
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> Digest32 {
        self.hasher.finalize().into()
    }
}

impl Default for ConcatHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the SHA-256 digest of arbitrary data.
pub fn hash_bytes(data: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of a string, hex encoded.
pub fn hash_hex(data: &str) -> String {
    hex::encode(hash_bytes(data.as_bytes()))
}

/// Generate a fresh 256-bit seed from the OS entropy source, hex encoded.
pub fn random_seed_hex() -> String {
    let mut bytes = [0u8; SEED_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison of two hex digests.
///
/// Case-insensitive so that clients submitting uppercase hex still verify.
pub fn digests_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x.to_ascii_lowercase() ^ y.to_ascii_lowercase()))
        == 0
}
