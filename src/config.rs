//! Transport configuration.
//!
//! The host proxy framework hands one [`Config`] record to both endpoints.
//! Unknown keys are ignored during deserialization; out-of-range numeric
//! values are clamped back to their defaults by [`Config::validate`].

use std::time::Duration;

use serde::Deserialize;

use crate::crypto::TAG_SIZE;
use crate::error::{Error, Result};
use crate::packet;

/// Wire wrapper applied to every outgoing datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObfuscationMode {
    /// Re-express packets as QUIC v1 Initials (default)
    QuicMimic,
    /// Wrap packets in DTLS 1.2 Application Data records
    WebrtcMimic,
    /// No outer wrapper
    Raw,
}

impl ObfuscationMode {
    /// Parse a mode name, accepting the common short aliases.
    pub fn from_name(s: &str) -> Self {
        match s {
            "quic" | "quic-mimic" | "QUIC" => ObfuscationMode::QuicMimic,
            "webrtc" | "webrtc-mimic" | "WEBRTC" => ObfuscationMode::WebrtcMimic,
            "raw" | "none" | "RAW" => ObfuscationMode::Raw,
            _ => ObfuscationMode::QuicMimic,
        }
    }
}

/// Size-based classifier mode for the priority send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityMode {
    /// Everything goes to the medium level
    None,
    /// Small frequent packets (games, VoIP) get the high level
    Gaming,
    /// Media-sized packets share the high level with signalling
    Streaming,
}

impl PriorityMode {
    /// Parse a mode name, accepting the common short aliases.
    pub fn from_name(s: &str) -> Self {
        match s {
            "gaming" | "game" | "GAMING" => PriorityMode::Gaming,
            "streaming" | "stream" | "STREAMING" => PriorityMode::Streaming,
            _ => PriorityMode::None,
        }
    }
}

/// Validated transport parameter record consumed by both endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Wire wrapper for outgoing datagrams
    pub obfuscation: ObfuscationMode,
    /// Priority classifier mode
    pub priority: PriorityMode,
    /// UDP payload cap in bytes (576..=1500)
    pub mtu: u32,
    /// Reserved for the stream-multiplexing layer (1..=256)
    pub max_streams: u32,
    /// Connection ID length in bytes (4..=20)
    pub connection_id_length: u32,
    /// Append random trailing padding to packets
    pub enable_padding: bool,
    /// Minimum padding size in bytes
    pub padding_min: u32,
    /// Maximum padding size in bytes
    pub padding_max: u32,
    /// Handshake wall-clock timeout in seconds (>= 1)
    pub handshake_timeout_s: u64,
    /// Keep-alive cadence in seconds; 0 disables keep-alive
    pub keepalive_interval_s: u64,
    /// Optional pre-shared key mixed into the HKDF salt
    pub psk: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            obfuscation: ObfuscationMode::QuicMimic,
            priority: PriorityMode::Gaming,
            mtu: 1400,
            max_streams: 16,
            connection_id_length: 8,
            enable_padding: true,
            padding_min: 40,
            padding_max: 200,
            handshake_timeout_s: 5,
            keepalive_interval_s: 15,
            psk: String::new(),
        }
    }
}

impl Config {
    /// Clamp out-of-range numeric values back to defaults and reject
    /// combinations the wire format cannot carry.
    ///
    /// The quic-mimic wrapper extracts a fixed 8-byte DCID, so it requires
    /// `connection_id_length == 8`; other lengths must use `raw` or
    /// `webrtc-mimic`.
    pub fn validate(&mut self) -> Result<()> {
        if !(576..=1500).contains(&self.mtu) {
            self.mtu = 1400;
        }
        if self.max_streams == 0 || self.max_streams > 256 {
            self.max_streams = 16;
        }
        if !(4..=20).contains(&self.connection_id_length) {
            self.connection_id_length = 8;
        }
        if self.padding_min > self.padding_max {
            self.padding_min = 40;
            self.padding_max = 200;
        }
        if self.handshake_timeout_s == 0 {
            self.handshake_timeout_s = 5;
        }
        if self.obfuscation == ObfuscationMode::QuicMimic && self.connection_id_length != 8 {
            return Err(Error::config(format!(
                "quic-mimic requires an 8-byte connection ID, got {}",
                self.connection_id_length
            )));
        }
        Ok(())
    }

    /// Connection ID length as a usize.
    pub fn cid_len(&self) -> usize {
        self.connection_id_length as usize
    }

    /// Maximum plaintext bytes per packet, after header, AEAD tag and
    /// padding-trailer overhead.
    pub fn max_payload(&self) -> usize {
        let header = packet::header_len(self.cid_len());
        let padding_trailer = if self.enable_padding { 2 } else { 0 };
        (self.mtu as usize).saturating_sub(header + TAG_SIZE + padding_trailer)
    }

    /// Handshake deadline as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_s)
    }

    /// Keep-alive cadence, or `None` when disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        if self.keepalive_interval_s == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keepalive_interval_s))
        }
    }

    /// Idle timeout after which the reaper removes a session: three
    /// keep-alive intervals, or five minutes when keep-alive is disabled.
    pub fn session_timeout(&self) -> Duration {
        if self.keepalive_interval_s == 0 {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(self.keepalive_interval_s * 3)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.obfuscation, ObfuscationMode::QuicMimic);
        assert_eq!(config.priority, PriorityMode::Gaming);
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.connection_id_length, 8);
        assert!(config.enable_padding);
        assert_eq!(config.padding_min, 40);
        assert_eq!(config.padding_max, 200);
        assert_eq!(config.handshake_timeout_s, 5);
        assert_eq!(config.keepalive_interval_s, 15);
        assert!(config.psk.is_empty());
    }

    #[test]
    fn test_validate_clamps_out_of_range() {
        let mut config = Config {
            mtu: 9000,
            max_streams: 1000,
            connection_id_length: 3,
            padding_min: 500,
            padding_max: 100,
            handshake_timeout_s: 0,
            ..Config::default()
        };
        config.validate().unwrap();

        assert_eq!(config.mtu, 1400);
        assert_eq!(config.max_streams, 16);
        assert_eq!(config.connection_id_length, 8);
        assert_eq!(config.padding_min, 40);
        assert_eq!(config.padding_max, 200);
        assert_eq!(config.handshake_timeout_s, 5);
    }

    #[test]
    fn test_quic_mimic_rejects_odd_cid_length() {
        let mut config = Config {
            connection_id_length: 12,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid(_))
        ));

        let mut config = Config {
            connection_id_length: 12,
            obfuscation: ObfuscationMode::Raw,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.connection_id_length, 12);
    }

    #[test]
    fn test_max_payload() {
        let config = Config::default();
        // mtu 1400 - header (1+4+8+4+2) - tag 16 - pad trailer 2
        assert_eq!(config.max_payload(), 1400 - 19 - 16 - 2);

        let config = Config {
            enable_padding: false,
            ..Config::default()
        };
        assert_eq!(config.max_payload(), 1400 - 19 - 16);
    }

    #[test]
    fn test_session_timeout() {
        let config = Config::default();
        assert_eq!(config.session_timeout(), Duration::from_secs(45));

        let config = Config {
            keepalive_interval_s: 0,
            ..Config::default()
        };
        assert_eq!(config.session_timeout(), Duration::from_secs(300));
        assert!(config.keepalive_interval().is_none());
    }

    #[test]
    fn test_mode_aliases() {
        assert_eq!(ObfuscationMode::from_name("quic"), ObfuscationMode::QuicMimic);
        assert_eq!(ObfuscationMode::from_name("webrtc"), ObfuscationMode::WebrtcMimic);
        assert_eq!(ObfuscationMode::from_name("none"), ObfuscationMode::Raw);
        assert_eq!(ObfuscationMode::from_name("garbage"), ObfuscationMode::QuicMimic);

        assert_eq!(PriorityMode::from_name("game"), PriorityMode::Gaming);
        assert_eq!(PriorityMode::from_name("stream"), PriorityMode::Streaming);
        assert_eq!(PriorityMode::from_name("off"), PriorityMode::None);
    }

    #[test]
    fn test_deserialize_ignores_unknown_keys() {
        let json = r#"{
            "obfuscation": "webrtc-mimic",
            "priority": "streaming",
            "mtu": 1280,
            "psk": "s3cret",
            "someFutureOption": true
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.obfuscation, ObfuscationMode::WebrtcMimic);
        assert_eq!(config.priority, PriorityMode::Streaming);
        assert_eq!(config.mtu, 1280);
        assert_eq!(config.psk, "s3cret");
        // Unspecified keys fall back to defaults
        assert_eq!(config.connection_id_length, 8);
    }
}
