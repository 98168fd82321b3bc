//! Error types for the tunnel transport.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the tunnel transport.
#[derive(Error, Debug)]
pub enum Error {
    /// Datagram shorter than the minimum decodable packet
    #[error("packet too short: {actual} bytes, need {expected}")]
    ShortPacket { expected: usize, actual: usize },

    /// First byte does not carry the long-header form and fixed bits
    #[error("invalid packet flags: 0x{0:02x}")]
    BadFlags(u8),

    /// Version field is not the protocol version
    #[error("unsupported version: 0x{0:08x}")]
    BadVersion(u32),

    /// No session exists for the connection ID and the packet is not a handshake
    #[error("unknown connection ID")]
    UnknownCid,

    /// AEAD tag verification failed (tampering, wrong key, wrong packet number)
    #[error("authentication failed")]
    AuthFailed,

    /// X25519 produced an all-zero shared secret
    #[error("key exchange produced a low-order point")]
    LowOrderPoint,

    /// No valid ServerHello arrived within the handshake deadline
    #[error("handshake timed out after {0}s")]
    HandshakeTimeout(u64),

    /// Session inbound queue is full; the packet was dropped
    #[error("inbound queue full")]
    InboundFull,

    /// Priority queue is full; the packet was dropped
    #[error("send queue full")]
    QueueFull,

    /// Operation on a closed session or connection
    #[error("session closed")]
    Closed,

    /// Configuration rejected at dial/listen time
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Internal cryptographic failure
    #[error("cryptographic failure: {0}")]
    Crypto(&'static str),

    /// Socket-level I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a short-packet error.
    pub fn short(expected: usize, actual: usize) -> Self {
        Error::ShortPacket { expected, actual }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::ConfigInvalid(msg.into())
    }

    /// Whether this error is a per-datagram failure that the receive path
    /// drops silently.
    pub fn is_wire_error(&self) -> bool {
        matches!(
            self,
            Error::ShortPacket { .. }
                | Error::BadFlags(_)
                | Error::BadVersion(_)
                | Error::UnknownCid
                | Error::AuthFailed
                | Error::InboundFull
        )
    }

    /// Whether this error indicates an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::AuthFailed)
    }
}
