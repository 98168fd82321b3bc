//! # GameTunnel
//!
//! A UDP-based encrypted tunnel transport for latency-sensitive traffic
//! (games, streaming, remote control). Traffic is wrapped in a QUIC Long
//! Header compatible packet shape so that deep-packet-inspection middleboxes
//! see QUIC-like flows.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │               Host proxy framework                       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Endpoints (dial / listen, chunked duplex views)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Hub (CID routing, migration, reaping) │ Priority queue  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Record layer (X25519 + HKDF + ChaCha20-Poly1305)        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Packet codec + obfuscation (quic-mimic / webrtc / raw)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Unobservability**: datagrams parse as QUIC v1 Initials (or DTLS 1.2
//!    records in webrtc-mimic mode)
//! 2. **Forward secrecy**: per-session ephemeral X25519 keys, optional PSK
//!    mixed into the key schedule
//! 3. **Low latency**: one-round-trip handshake, three-level priority send
//!    scheduling with starvation protection
//! 4. **UDP semantics**: losses and reordering pass through; nothing blocks
//!    the shared receive loop

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod hub;
pub mod obfs;
pub mod packet;
pub mod priority;
pub mod session;

mod dialer;
mod listener;

pub use config::{Config, ObfuscationMode, PriorityMode};
pub use dialer::{dial, ClientConn};
pub use error::{Error, Result};
pub use listener::{listen, Listener, SessionConn};

/// Name under which the host proxy framework registers this transport.
pub const TRANSPORT_NAME: &str = "gametunnel";

/// Socket buffer size requested in each direction (advisory; the OS may
/// clamp it).
pub const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_name() {
        assert_eq!(TRANSPORT_NAME, "gametunnel");
    }

    #[test]
    fn test_default_config_is_valid() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
    }
}
