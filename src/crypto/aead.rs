//! Authenticated encryption for the record layer.
//!
//! ChaCha20-Poly1305 with one cipher per traffic direction. The nonce is
//! eight zero bytes followed by the big-endian 32-bit packet number, so
//! nonce uniqueness rests entirely on the session's monotonic packet-number
//! counter. The packet header (flags, version, connection ID) rides as
//! additional authenticated data.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zeroize::Zeroize;

use crate::crypto::{DirectionKeys, Role, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Build the 12-byte nonce for a packet number: `0^8 ‖ be32(pn)`.
pub fn build_nonce(packet_number: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[8..].copy_from_slice(&packet_number.to_be_bytes());
    nonce
}

/// Per-session AEAD state: one send cipher, one receive cipher.
///
/// A client sends with the client-to-server key; a server sends with the
/// server-to-client key. Raw key bytes are retained for diagnostics and
/// zeroized on drop.
pub struct SessionCrypto {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_key: [u8; KEY_SIZE],
    recv_key: [u8; KEY_SIZE],
}

impl SessionCrypto {
    /// Assign the direction keys according to the endpoint role.
    pub fn new(keys: &DirectionKeys, role: Role) -> Self {
        let (send_key, recv_key) = match role {
            Role::Client => (*keys.client_to_server(), *keys.server_to_client()),
            Role::Server => (*keys.server_to_client(), *keys.client_to_server()),
        };
        Self {
            send: ChaCha20Poly1305::new(&send_key.into()),
            recv: ChaCha20Poly1305::new(&recv_key.into()),
            send_key,
            recv_key,
        }
    }

    /// Encrypt a payload. Returns ciphertext with the 16-byte tag appended.
    pub fn seal(&self, plaintext: &[u8], packet_number: u32, aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = build_nonce(packet_number);
        self.send
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::Crypto("encryption failed"))
    }

    /// Decrypt a payload.
    ///
    /// Tampering, a wrong key, a wrong packet number and a wrong header all
    /// collapse into [`Error::AuthFailed`].
    pub fn open(&self, ciphertext: &[u8], packet_number: u32, aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::AuthFailed);
        }
        let nonce = build_nonce(packet_number);
        self.recv
            .decrypt(
                (&nonce).into(),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::AuthFailed)
    }

    /// Raw outgoing-direction key bytes.
    pub fn send_key(&self) -> &[u8; KEY_SIZE] {
        &self.send_key
    }

    /// Raw incoming-direction key bytes.
    pub fn recv_key(&self) -> &[u8; KEY_SIZE] {
        &self.recv_key
    }
}

impl Drop for SessionCrypto {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
    }
}
