//! Error types for the pipeline crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// What kind of corruption was detected in a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// The checksum stored with the record does not match its payload.
    ChecksumMismatch,
    /// The record's length prefix runs past the end of the segment.
    TruncatedLength,
    /// The payload bytes could not be decoded by the wire codec.
    BadEncoding,
    /// A type tag in the payload is not one the codec recognizes.
    UnknownTypeTag(u8),
}

impl std::fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptionKind::ChecksumMismatch => write!(f, "checksum mismatch"),
            CorruptionKind::TruncatedLength => write!(f, "truncated length prefix"),
            CorruptionKind::BadEncoding => write!(f, "malformed wire encoding"),
            CorruptionKind::UnknownTypeTag(tag) => write!(f, "unknown type tag {tag}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("batch is empty")]
    EmptyBatch,

    #[error("invalid entry at index {index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("failed to durably append batch: {0}")]
    DurableAppendFailed(String),

    #[error("corrupt record at log offset {offset}: {kind}")]
    Corrupt { offset: u64, kind: CorruptionKind },

    #[error("malformed configuration or record: {reason}")]
    Malformed { reason: String },

    #[error("sql error: {0}")]
    SqlError(String),

    #[error("checkpoint missing or unreadable")]
    CheckpointMissing,

    #[error("cache rebuild from admin store failed: {0}")]
    RebuildFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("segment full and rolling is disabled")]
    SegmentFull,
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::SqlError(e.to_string())
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(e: toml::de::Error) -> Self {
        PipelineError::Malformed { reason: e.to_string() }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PipelineError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        PipelineError::Lock(e.to_string())
    }
}
