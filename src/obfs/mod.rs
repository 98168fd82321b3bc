//! Wire obfuscation.
//!
//! An [`Obfuscator`] transforms an encoded packet into the datagram that
//! actually hits the wire, and back. Three variants:
//!
//! 1. **quic-mimic**: re-expresses the packet as a QUIC v1 Initial; even
//!    Wireshark decodes the result as QUIC
//! 2. **webrtc-mimic**: wraps the packet in a DTLS 1.2 Application Data
//!    record, indistinguishable from a video call to carrier DPI
//! 3. **raw**: identity, for networks without DPI
//!
//! Wrap/unwrap round-trips preserve the inner connection ID and payload;
//! quic-mimic is allowed to substitute the version on the wire, and the
//! unwrapped result is normalized back to the protocol version.

mod quic;
mod raw;
mod webrtc;

pub use quic::QuicMimic;
pub use raw::Raw;
pub use webrtc::WebRtcMimic;

use std::sync::Arc;

use rand::Rng;

use crate::config::ObfuscationMode;
use crate::error::{Error, Result};

/// Two-method wrapping contract every variant implements.
pub trait Obfuscator: Send + Sync {
    /// Transform an encoded packet into an on-wire datagram.
    fn wrap(&self, packet: &[u8]) -> Result<Vec<u8>>;

    /// Recover the encoded packet from an on-wire datagram.
    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Obfuscator name as it appears in configuration.
    fn name(&self) -> &'static str;
}

/// Construct the obfuscator selected by the configuration.
pub fn new_obfuscator(mode: ObfuscationMode) -> Arc<dyn Obfuscator> {
    match mode {
        ObfuscationMode::QuicMimic => Arc::new(QuicMimic),
        ObfuscationMode::WebrtcMimic => Arc::new(WebRtcMimic::new()),
        ObfuscationMode::Raw => Arc::new(Raw),
    }
}

/// Encode a value as a QUIC variable-length integer (RFC 9000 §16).
///
/// The two high bits of the first byte select a 1/2/4/8-byte encoding with
/// 6/14/30/62 value bits.
pub fn encode_varint(value: u64) -> Vec<u8> {
    if value <= 63 {
        vec![value as u8]
    } else if value <= 16_383 {
        ((value as u16) | 0x4000).to_be_bytes().to_vec()
    } else if value <= 1_073_741_823 {
        ((value as u32) | 0x8000_0000).to_be_bytes().to_vec()
    } else {
        (value | 0xC000_0000_0000_0000).to_be_bytes().to_vec()
    }
}

/// Decode a QUIC variable-length integer. Returns the value and the number
/// of bytes consumed.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data.first().ok_or_else(|| Error::short(1, 0))?;
    match first >> 6 {
        0 => Ok(((first & 0x3F) as u64, 1)),
        1 => {
            if data.len() < 2 {
                return Err(Error::short(2, data.len()));
            }
            let value = u16::from_be_bytes([data[0], data[1]]) & 0x3FFF;
            Ok((value as u64, 2))
        }
        2 => {
            if data.len() < 4 {
                return Err(Error::short(4, data.len()));
            }
            let value =
                u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x3FFF_FFFF;
            Ok((value as u64, 4))
        }
        _ => {
            if data.len() < 8 {
                return Err(Error::short(8, data.len()));
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[..8]);
            Ok((u64::from_be_bytes(bytes) & 0x3FFF_FFFF_FFFF_FFFF, 8))
        }
    }
}

/// Pick a padded datagram size that lands inside a realistic QUIC size
/// distribution.
///
/// Three bands modelled on captured browser traffic: small ACK-like frames,
/// medium transfers, and Initial-sized packets near the 1200-byte floor.
/// The result is clamped to `mtu` and never smaller than the payload.
pub fn target_padded_size(payload_size: usize, mtu: usize) -> usize {
    let mut rng = rand::thread_rng();

    let target = if payload_size < 100 {
        rng.gen_range(40..100)
    } else if payload_size < 500 {
        rng.gen_range(100..500)
    } else {
        rng.gen_range(1200..1280).min(mtu)
    };

    target.max(payload_size)
}
