//! Length+CRC framing for a single log record.
//!
//! On-disk shape: `u32 length_le | u32 crc32c_le | body[length]`. `length`
//! counts only `body`.

use crate::checksum;
use crate::error::{CorruptionKind, PipelineError, Result};

pub const HEADER_LEN: usize = 8;

/// Frames `body` with its length and CRC32C, ready to append to a segment.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum::compute(body).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Result of successfully parsing one frame out of a byte slice.
pub struct Parsed<'a> {
    pub body: &'a [u8],
    pub consumed: usize,
}

/// Parses one frame starting at the beginning of `bytes`, validating its
/// checksum. `offset` is the record's log offset, used only to annotate
/// corruption errors.
pub fn parse<'a>(bytes: &'a [u8], offset: u64) -> Result<Parsed<'a>> {
    if bytes.len() < HEADER_LEN {
        return Err(PipelineError::Corrupt { offset, kind: CorruptionKind::TruncatedLength });
    }
    let length = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let expected_crc = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if bytes.len() < HEADER_LEN + length {
        return Err(PipelineError::Corrupt { offset, kind: CorruptionKind::TruncatedLength });
    }
    let body = &bytes[HEADER_LEN..HEADER_LEN + length];
    if checksum::compute(body) != expected_crc {
        return Err(PipelineError::Corrupt { offset, kind: CorruptionKind::ChecksumMismatch });
    }
    Ok(Parsed { body, consumed: HEADER_LEN + length })
}
