//! Cryptographic primitives for the tunnel.
//!
//! This module provides:
//! - X25519 Elliptic Curve Diffie-Hellman key exchange
//! - HKDF-SHA256 key schedule with an optional pre-shared-key mixin
//! - ChaCha20-Poly1305 AEAD with packet-number nonces
//! - The 72-byte handshake payload codec
//! - Secure random number generation
//!
//! Secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod handshake;
mod kdf;
mod keys;
mod random;

pub use aead::{build_nonce, SessionCrypto};
pub use handshake::{HandshakePayload, HANDSHAKE_PAYLOAD_SIZE};
pub use kdf::{derive_direction_keys, DirectionKeys, Role};
pub use keys::{KeyPair, SharedSecret};
pub use random::SecureRandom;

/// Size of symmetric keys in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of X25519 public keys in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_key_exchange_and_encryption() {
        // Both endpoints generate ephemeral keypairs
        let client = KeyPair::generate();
        let server = KeyPair::generate();

        // Both sides compute the shared secret
        let client_shared = client.shared_secret(&server.public_bytes()).unwrap();
        let server_shared = server.shared_secret(&client.public_bytes()).unwrap();
        assert_eq!(client_shared.as_bytes(), server_shared.as_bytes());

        // Derive per-direction keys with a PSK mixin
        let client_keys = derive_direction_keys(&client_shared, "shared-psk").unwrap();
        let server_keys = derive_direction_keys(&server_shared, "shared-psk").unwrap();

        let client_crypto = SessionCrypto::new(&client_keys, Role::Client);
        let server_crypto = SessionCrypto::new(&server_keys, Role::Server);

        // Keys cross over between the two roles
        assert_eq!(client_crypto.send_key(), server_crypto.recv_key());
        assert_eq!(client_crypto.recv_key(), server_crypto.send_key());
        assert_ne!(client_crypto.send_key(), client_crypto.recv_key());

        // Data encrypted by one side opens on the other
        let aad = b"flags-version-cid";
        let ciphertext = client_crypto.seal(b"player input", 7, aad).unwrap();
        let plaintext = server_crypto.open(&ciphertext, 7, aad).unwrap();
        assert_eq!(plaintext, b"player input");
    }
}
