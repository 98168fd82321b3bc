//! Identity obfuscator for networks without DPI.

use crate::error::Result;
use crate::obfs::Obfuscator;

/// Passes packets through unchanged.
pub struct Raw;

impl Obfuscator for Raw {
    fn wrap(&self, packet: &[u8]) -> Result<Vec<u8>> {
        Ok(packet.to_vec())
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}
