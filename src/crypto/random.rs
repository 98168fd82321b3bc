//! Secure random number generation.
//!
//! Wraps the operating system's entropy source (/dev/urandom on Unix,
//! BCryptGenRandom on Windows).

use rand::RngCore;
use rand_core::OsRng;

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u64.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }
}
