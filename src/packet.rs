//! Packet framing and serialization.
//!
//! Every packet is shaped like a QUIC Long Header so that the first byte
//! passes DPI heuristics. Wire layout (big-endian integers throughout):
//!
//! ```text
//! ┌───────┬─────────┬──────────┬────────┬────────────┬─────────┐
//! │ Flags │ Version │ Conn ID  │ PktNum │ PayloadLen │ Payload │
//! │  1 B  │   4 B   │ cidLen B │  4 B   │    2 B     │   var   │
//! ├───────┴─────────┴──────────┴────────┴────────────┴─────────┤
//! │ [ Padding (var) │ PadLen (2 B) ]  when Flags.padding       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Flags byte: bit 7 = form (always 1, Long Header), bit 6 = fixed (always
//! 1), bits 5-4 = packet kind, bit 3 = padding present, bits 2-0 reserved
//! and serialized as zero so the flags byte is a stable AEAD header.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::config::Config;
use crate::crypto::SecureRandom;
use crate::error::{Error, Result};

/// Constant protocol version, matching QUIC v1 on the wire.
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Smallest datagram the route path will consider:
/// flags(1) + version(4) + min CID(4) + pktnum(4) + payloadLen(2).
/// Unpadded Control and KeepAlive packets sit just above this floor.
pub const MIN_PACKET_SIZE: usize = 15;

/// Upper bound used for receive buffers.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Long Header form bit (bit 7).
pub const FLAG_FORM: u8 = 0x80;
/// Fixed bit (bit 6), always 1 in QUIC.
pub const FLAG_FIXED: u8 = 0x40;
/// Packet kind mask (bits 5-4).
pub const FLAG_KIND_MASK: u8 = 0x30;
/// Packet kind shift.
pub const FLAG_KIND_SHIFT: u8 = 4;
/// Padding-present bit (bit 3).
pub const FLAG_PADDING: u8 = 0x08;

/// Packet kinds carried in flags bits 5-4.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Encrypted application data
    Data = 0x00,
    /// Key exchange (ClientHello / ServerHello)
    Handshake = 0x01,
    /// NAT-keeping liveness probe
    KeepAlive = 0x02,
    /// Session control (close, ping, pong)
    Control = 0x03,
}

impl TryFrom<u8> for PacketKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(PacketKind::Data),
            0x01 => Ok(PacketKind::Handshake),
            0x02 => Ok(PacketKind::KeepAlive),
            0x03 => Ok(PacketKind::Control),
            other => Err(Error::BadFlags(other)),
        }
    }
}

/// A tunnel packet in memory.
///
/// `payload` holds plaintext before encryption and ciphertext after; the
/// codec does not care which.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet kind
    pub kind: PacketKind,
    /// Session connection ID
    pub connection_id: Bytes,
    /// Monotonic per-session packet number
    pub packet_number: u32,
    /// Payload bytes
    pub payload: Bytes,
    /// Whether trailing random padding is appended on encode
    pub has_padding: bool,
}

/// Fixed header length up to and including the payload-length field.
pub fn header_len(cid_len: usize) -> usize {
    1 + 4 + cid_len + 4 + 2
}

/// Length of the AEAD additional data: flags, version and connection ID.
pub fn aad_len(cid_len: usize) -> usize {
    1 + 4 + cid_len
}

/// Quick classifier for incoming datagrams: QUIC Long Header form and
/// fixed bits both set.
pub fn is_quic_like(first_byte: u8) -> bool {
    first_byte & (FLAG_FORM | FLAG_FIXED) == (FLAG_FORM | FLAG_FIXED)
}

/// Build the AEAD additional data for a packet that has not been encoded
/// yet: the flags byte, version and connection ID it will carry.
pub fn encode_aad(kind: PacketKind, has_padding: bool, connection_id: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(aad_len(connection_id.len()));
    buf.put_u8(encode_flags(kind, has_padding));
    buf.put_u32(PROTOCOL_VERSION);
    buf.put_slice(connection_id);
    buf.freeze()
}

/// Encode the flags byte for a kind and padding marker.
pub fn encode_flags(kind: PacketKind, has_padding: bool) -> u8 {
    let mut flags = FLAG_FORM | FLAG_FIXED;
    flags |= (kind as u8) << FLAG_KIND_SHIFT;
    if has_padding {
        flags |= FLAG_PADDING;
    }
    flags
}

/// Decode the flags byte, rejecting anything that is not a well-formed
/// Long Header first byte.
pub fn decode_flags(flags: u8) -> Result<(PacketKind, bool)> {
    if flags & FLAG_FORM == 0 || flags & FLAG_FIXED == 0 {
        return Err(Error::BadFlags(flags));
    }
    let kind = PacketKind::try_from((flags & FLAG_KIND_MASK) >> FLAG_KIND_SHIFT)?;
    Ok((kind, flags & FLAG_PADDING != 0))
}

/// Generate a cryptographically random connection ID.
pub fn generate_connection_id(len: usize) -> Result<Bytes> {
    if !(4..=20).contains(&len) {
        return Err(Error::config(format!(
            "connection ID length must be 4-20, got {len}"
        )));
    }
    let mut id = vec![0u8; len];
    SecureRandom::fill(&mut id);
    Ok(Bytes::from(id))
}

impl Packet {
    /// Create a data packet.
    pub fn data(
        connection_id: Bytes,
        packet_number: u32,
        payload: Bytes,
        has_padding: bool,
    ) -> Self {
        Self {
            kind: PacketKind::Data,
            connection_id,
            packet_number,
            payload,
            has_padding,
        }
    }

    /// Create a handshake packet. Handshakes always carry padding to mask
    /// the size of the key material.
    pub fn handshake(connection_id: Bytes, packet_number: u32, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Handshake,
            connection_id,
            packet_number,
            payload,
            has_padding: true,
        }
    }

    /// Create an empty keep-alive packet, padded to mask its emptiness.
    pub fn keep_alive(connection_id: Bytes, packet_number: u32) -> Self {
        Self {
            kind: PacketKind::KeepAlive,
            connection_id,
            packet_number,
            payload: Bytes::new(),
            has_padding: true,
        }
    }

    /// Create a control packet.
    pub fn control(connection_id: Bytes, packet_number: u32, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Control,
            connection_id,
            packet_number,
            payload,
            has_padding: false,
        }
    }

    /// Serialize the packet for the wire.
    ///
    /// When the padding flag is set and padding is enabled, a random pad of
    /// `[padding_min, padding_max)` cryptographically random bytes plus a
    /// big-endian 16-bit length trailer is appended.
    pub fn encode(&self, config: &Config) -> Result<Bytes> {
        let cid_len = config.cid_len();
        if self.connection_id.len() != cid_len {
            return Err(Error::config(format!(
                "connection ID length mismatch: got {}, expected {}",
                self.connection_id.len(),
                cid_len
            )));
        }

        let padding_len = if self.has_padding && config.enable_padding {
            let min = config.padding_min as usize;
            let max = config.padding_max as usize;
            if max > min {
                rand::thread_rng().gen_range(min..max)
            } else {
                min
            }
        } else {
            0
        };

        let mut buf = BytesMut::with_capacity(
            header_len(cid_len) + self.payload.len() + padding_len + 2,
        );

        buf.put_u8(encode_flags(self.kind, self.has_padding));
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_slice(&self.connection_id);
        buf.put_u32(self.packet_number);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);

        if self.has_padding && padding_len > 0 {
            let mut padding = vec![0u8; padding_len];
            SecureRandom::fill(&mut padding);
            buf.put_slice(&padding);
            buf.put_u16(padding_len as u16);
        }

        Ok(buf.freeze())
    }

    /// Deserialize a packet received from the wire.
    ///
    /// The trailing padding region is not inspected; only the declared
    /// payload is extracted.
    pub fn decode(data: &[u8], cid_len: usize) -> Result<Packet> {
        let min = header_len(cid_len);
        if data.len() < min {
            return Err(Error::short(min, data.len()));
        }

        let (kind, has_padding) = decode_flags(data[0])?;

        let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        if version != PROTOCOL_VERSION {
            return Err(Error::BadVersion(version));
        }

        let mut offset = 5;
        let connection_id = Bytes::copy_from_slice(&data[offset..offset + cid_len]);
        offset += cid_len;

        let packet_number = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        offset += 4;

        let payload_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;

        if offset + payload_len > data.len() {
            return Err(Error::short(offset + payload_len, data.len()));
        }
        let payload = Bytes::copy_from_slice(&data[offset..offset + payload_len]);

        Ok(Packet {
            kind,
            connection_id,
            packet_number,
            payload,
            has_padding,
        })
    }
}
