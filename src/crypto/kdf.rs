//! Key schedule.
//!
//! HKDF-SHA256 in extract-then-expand derives one 32-byte key per traffic
//! direction from the X25519 shared secret. When a pre-shared key is
//! configured, its SHA-256 digest is appended to the extraction salt, so an
//! attacker needs both the ECDH private key and the PSK to recover traffic.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SharedSecret, KEY_SIZE};
use crate::error::{Error, Result};

/// Static HKDF extraction salt.
pub const HKDF_SALT: &[u8] = b"GameTunnel-v1-salt";

/// HKDF info for the client-to-server key.
pub const INFO_CLIENT_TO_SERVER: &[u8] = b"gametunnel client-to-server";

/// HKDF info for the server-to-client key.
pub const INFO_SERVER_TO_CLIENT: &[u8] = b"gametunnel server-to-client";

/// Which side of the tunnel this endpoint plays. Determines which derived
/// key encrypts outgoing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiating endpoint: sends with the client-to-server key
    Client,
    /// Listening endpoint: sends with the server-to-client key
    Server,
}

/// The two direction keys produced by the schedule. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    client_to_server: [u8; KEY_SIZE],
    server_to_client: [u8; KEY_SIZE],
}

impl DirectionKeys {
    /// Key protecting client-to-server traffic.
    pub fn client_to_server(&self) -> &[u8; KEY_SIZE] {
        &self.client_to_server
    }

    /// Key protecting server-to-client traffic.
    pub fn server_to_client(&self) -> &[u8; KEY_SIZE] {
        &self.server_to_client
    }
}

/// Derive the per-direction keys from a shared secret and optional PSK.
pub fn derive_direction_keys(shared: &SharedSecret, psk: &str) -> Result<DirectionKeys> {
    let salt = if psk.is_empty() {
        HKDF_SALT.to_vec()
    } else {
        let digest = Sha256::digest(psk.as_bytes());
        let mut combined = Vec::with_capacity(HKDF_SALT.len() + digest.len());
        combined.extend_from_slice(HKDF_SALT);
        combined.extend_from_slice(&digest);
        combined
    };

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());

    let mut client_to_server = [0u8; KEY_SIZE];
    hk.expand(INFO_CLIENT_TO_SERVER, &mut client_to_server)
        .map_err(|_| Error::Crypto("HKDF expansion failed"))?;

    let mut server_to_client = [0u8; KEY_SIZE];
    hk.expand(INFO_SERVER_TO_CLIENT, &mut server_to_client)
        .map_err(|_| Error::Crypto("HKDF expansion failed"))?;

    Ok(DirectionKeys {
        client_to_server,
        server_to_client,
    })
}
