//! X25519 key exchange primitives.
//!
//! Type-safe wrappers around X25519 with automatic zeroization of secret
//! material on drop. The secret side is held as a `StaticSecret` because a
//! server keeps its handshake keypair alive for the whole session to answer
//! ServerHello retransmit requests.

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::PUBLIC_KEY_SIZE;
use crate::error::{Error, Result};

/// An X25519 keypair used for the one-round-trip handshake.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair. The scalar is clamped per RFC 7748
    /// before use.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key bytes to place in a handshake payload.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Compute the X25519 shared secret with the peer's public key.
    ///
    /// An all-zero result means the peer supplied a low-order point and the
    /// handshake must fail.
    pub fn shared_secret(&self, their_public: &[u8; PUBLIC_KEY_SIZE]) -> Result<SharedSecret> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        let bytes = *shared.as_bytes();
        if bytes.iter().all(|&b| b == 0) {
            return Err(Error::LowOrderPoint);
        }
        Ok(SharedSecret(bytes))
    }
}

/// The result of an X25519 key agreement.
///
/// Must be fed through the HKDF schedule before use as a key. Zeroized on
/// drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Raw shared-secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
