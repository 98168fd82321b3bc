//! DTLS 1.2 record mimicry.
//!
//! WebRTC media flows over DTLS, and carriers rarely interfere with it
//! because video calls depend on it. The wrapper frames each packet as a
//! DTLS Application Data record:
//!
//! ```text
//! content_type(1)=23 | version(2)=FE FD | epoch(2) | seq(6) | length(2) | body
//! ```

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::obfs::Obfuscator;

const DTLS_HEADER_SIZE: usize = 13;
const CONTENT_TYPE_APPLICATION_DATA: u8 = 23;
const DTLS_VERSION: [u8; 2] = [0xFE, 0xFD]; // DTLS 1.2

/// Obfuscator that frames packets as DTLS 1.2 records.
pub struct WebRtcMimic {
    epoch: AtomicU16,
}

impl WebRtcMimic {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU16::new(0),
        }
    }

    /// Low 48 bits of the nanosecond clock; looks like a plausible record
    /// sequence to DPI.
    fn sequence_number() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            & 0xFFFF_FFFF_FFFF
    }
}

impl Default for WebRtcMimic {
    fn default() -> Self {
        Self::new()
    }
}

impl Obfuscator for WebRtcMimic {
    fn wrap(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let seq = Self::sequence_number();
        let epoch = self.epoch.load(Ordering::Relaxed);

        let mut out = Vec::with_capacity(DTLS_HEADER_SIZE + packet.len());
        out.push(CONTENT_TYPE_APPLICATION_DATA);
        out.extend_from_slice(&DTLS_VERSION);
        out.extend_from_slice(&epoch.to_be_bytes());
        out.extend_from_slice(&seq.to_be_bytes()[2..8]);
        out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        out.extend_from_slice(packet);

        Ok(out)
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < DTLS_HEADER_SIZE {
            return Err(Error::short(DTLS_HEADER_SIZE, data.len()));
        }
        if data[0] != CONTENT_TYPE_APPLICATION_DATA {
            return Err(Error::BadFlags(data[0]));
        }
        if data[1..3] != DTLS_VERSION {
            return Err(Error::BadVersion(u16::from_be_bytes([data[1], data[2]]) as u32));
        }

        let body_len = u16::from_be_bytes([data[11], data[12]]) as usize;
        if body_len > data.len() - DTLS_HEADER_SIZE {
            return Err(Error::short(DTLS_HEADER_SIZE + body_len, data.len()));
        }

        Ok(data[DTLS_HEADER_SIZE..DTLS_HEADER_SIZE + body_len].to_vec())
    }

    fn name(&self) -> &'static str {
        "webrtc-mimic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header() {
        let obfs = WebRtcMimic::new();
        let wire = obfs.wrap(b"hello").unwrap();

        assert_eq!(wire.len(), DTLS_HEADER_SIZE + 5);
        assert_eq!(wire[0], 23);
        assert_eq!(&wire[1..3], &[0xFE, 0xFD]);
        assert_eq!(&wire[3..5], &[0, 0]); // epoch 0
        assert_eq!(u16::from_be_bytes([wire[11], wire[12]]), 5);
        assert_eq!(&wire[13..], b"hello");
    }

    #[test]
    fn test_roundtrip() {
        let obfs = WebRtcMimic::new();
        let payload = vec![0x5A; 700];
        let wire = obfs.wrap(&payload).unwrap();
        assert_eq!(obfs.unwrap(&wire).unwrap(), payload);
    }

    #[test]
    fn test_unwrap_validates_header() {
        let obfs = WebRtcMimic::new();
        let mut wire = obfs.wrap(b"data").unwrap();

        wire[0] = 22; // handshake content type
        assert!(matches!(obfs.unwrap(&wire), Err(Error::BadFlags(_))));

        wire[0] = 23;
        wire[2] = 0xFC;
        assert!(matches!(obfs.unwrap(&wire), Err(Error::BadVersion(_))));
    }

    #[test]
    fn test_unwrap_rejects_length_mismatch() {
        let obfs = WebRtcMimic::new();
        let wire = obfs.wrap(b"data").unwrap();
        assert!(obfs.unwrap(&wire[..wire.len() - 2]).is_err());
        assert!(obfs.unwrap(&wire[..5]).is_err());
    }
}
