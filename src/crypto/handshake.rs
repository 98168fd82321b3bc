//! Handshake payload codec.
//!
//! Both hello messages carry the same 72-byte body:
//! a 32-byte X25519 public key, an 8-byte big-endian Unix-seconds
//! timestamp, and 32 random bytes of entropy.

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::{SecureRandom, PUBLIC_KEY_SIZE};
use crate::error::{Error, Result};

/// Encoded size of a handshake payload.
pub const HANDSHAKE_PAYLOAD_SIZE: usize = PUBLIC_KEY_SIZE + 8 + 32;

/// Body of a ClientHello or ServerHello packet.
#[derive(Debug, Clone)]
pub struct HandshakePayload {
    /// Sender's X25519 public key
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Unix timestamp in seconds at send time
    pub timestamp: u64,
    /// Random entropy
    pub random: [u8; 32],
}

impl HandshakePayload {
    /// Build a payload with fresh random entropy.
    pub fn new(public_key: [u8; PUBLIC_KEY_SIZE], timestamp: u64) -> Self {
        Self {
            public_key,
            timestamp,
            random: SecureRandom::bytes(),
        }
    }

    /// Serialize to the fixed 72-byte wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_PAYLOAD_SIZE);
        buf.put_slice(&self.public_key);
        buf.put_u64(self.timestamp);
        buf.put_slice(&self.random);
        buf.freeze()
    }

    /// Deserialize from a packet payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_PAYLOAD_SIZE {
            return Err(Error::short(HANDSHAKE_PAYLOAD_SIZE, data.len()));
        }

        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(&data[..PUBLIC_KEY_SIZE]);

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + 8]);

        let mut random = [0u8; 32];
        random.copy_from_slice(&data[PUBLIC_KEY_SIZE + 8..HANDSHAKE_PAYLOAD_SIZE]);

        Ok(Self {
            public_key,
            timestamp: u64::from_be_bytes(ts),
            random,
        })
    }
}
