//! QUIC v1 Initial mimicry.
//!
//! The encoded packet already starts with a QUIC-compatible flags byte.
//! Advanced DPI checks the fields after it, so the wrapper rebuilds the
//! datagram as a complete Initial:
//!
//! ```text
//! flags(1) | version(4) | dcid_len(1) | dcid(8) | scid_len(1) | scid(8)
//!         | token_len(varint=0) | payload_len(varint) | remaining bytes
//! ```
//!
//! The DCID is the first 8 bytes of the inner connection ID field; the
//! SCID is random per datagram; the wire version alternates between QUIC
//! v1 and v2. Unwrap discards the fake fields and restores the inner
//! header with the protocol version.

use rand::Rng;

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};
use crate::obfs::{decode_varint, encode_varint, Obfuscator};
use crate::packet::PROTOCOL_VERSION;

/// Wire versions a real client population would show.
const QUIC_VERSIONS: [u32; 2] = [
    0x0000_0001, // QUIC v1 (RFC 9000)
    0x6B33_43CF, // QUIC v2 (RFC 9369)
];

/// DCID length emitted on the wire. The wrapper assumes the inner
/// connection ID is exactly this long; config validation enforces it.
const DCID_LEN: usize = 8;

/// Obfuscator that re-expresses packets as QUIC Initials.
pub struct QuicMimic;

impl Obfuscator for QuicMimic {
    fn wrap(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < 1 + 4 + DCID_LEN {
            return Err(Error::short(1 + 4 + DCID_LEN, packet.len()));
        }

        let flags = packet[0];
        // Everything after flags + version: connection ID onward
        let inner = &packet[5..];
        let dcid = &inner[..DCID_LEN];
        let rest = &inner[DCID_LEN..];

        let scid: [u8; 8] = SecureRandom::bytes();
        let version = QUIC_VERSIONS[rand::thread_rng().gen_range(0..QUIC_VERSIONS.len())];
        let payload_len = encode_varint(rest.len() as u64);

        let mut out =
            Vec::with_capacity(1 + 4 + 1 + DCID_LEN + 1 + scid.len() + 1 + payload_len.len() + rest.len());
        out.push(flags);
        out.extend_from_slice(&version.to_be_bytes());
        out.push(DCID_LEN as u8);
        out.extend_from_slice(dcid);
        out.push(scid.len() as u8);
        out.extend_from_slice(&scid);
        out.push(0x00); // token length = 0, no retry token
        out.extend_from_slice(&payload_len);
        out.extend_from_slice(rest);

        Ok(out)
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 7 {
            return Err(Error::short(7, data.len()));
        }

        let flags = data[0];
        let mut offset = 1 + 4; // skip the wire version

        let dcid_len = data[offset] as usize;
        offset += 1;
        if offset + dcid_len > data.len() {
            return Err(Error::short(offset + dcid_len, data.len()));
        }
        let dcid = &data[offset..offset + dcid_len];
        offset += dcid_len;

        if offset >= data.len() {
            return Err(Error::short(offset + 1, data.len()));
        }
        let scid_len = data[offset] as usize;
        offset += 1;
        if offset + scid_len > data.len() {
            return Err(Error::short(offset + scid_len, data.len()));
        }
        offset += scid_len;

        let (token_len, consumed) = decode_varint(&data[offset..])?;
        offset += consumed;
        if offset + token_len as usize > data.len() {
            return Err(Error::short(offset + token_len as usize, data.len()));
        }
        offset += token_len as usize;

        let (_, consumed) = decode_varint(&data[offset..])?;
        offset += consumed;

        let rest = &data[offset..];

        let mut out = Vec::with_capacity(1 + 4 + dcid_len + rest.len());
        out.push(flags);
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.extend_from_slice(dcid);
        out.extend_from_slice(rest);

        Ok(out)
    }

    fn name(&self) -> &'static str {
        "quic-mimic"
    }
}
