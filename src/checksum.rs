//! CRC32C integrity checking for log records and checkpoint bodies.

use crc32fast::Hasher;

/// Computes the CRC32C of `data`.
pub fn compute(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verifies `data` against an expected CRC32C value.
pub fn verify(data: &[u8], expected: u32) -> Result<(), ChecksumMismatch> {
    let actual = compute(data);
    if actual != expected {
        return Err(ChecksumMismatch { expected, actual, data_len: data.len() });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub expected: u32,
    pub actual: u32,
    pub data_len: usize,
}

impl std::fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checksum mismatch: expected {:#010x}, got {:#010x} (data_len={})",
            self.expected, self.actual, self.data_len
        )
    }
}

/// Incremental CRC32C builder for streaming writers.
pub struct ChecksumBuilder {
    hasher: Hasher,
}

impl ChecksumBuilder {
    pub fn new() -> Self {
        Self { hasher: Hasher::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl Default for ChecksumBuilder {
    fn default() -> Self {
        Self::new()
    }
}
