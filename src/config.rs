//! Pipeline configuration and durability levels.
//!
//! `PipelineConfig` is the single source of truth for every tunable the
//! pipeline exposes, loadable from a TOML file at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Durability level for the segmented log.
///
/// Trades write latency against the amount of data a crash can lose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// fsync after every append. Zero data loss on crash, highest latency.
    Synchronous,

    /// Concurrent appenders share a single fsync: the first caller in a
    /// window flushes for everyone waiting behind it.
    GroupCommit {
        /// Max number of appends batched into one flush.
        max_batch_size: usize,
        /// Max time an append waits before a flush is forced, in microseconds.
        max_wait_us: u64,
    },

    /// A background timer fsyncs on a fixed interval. A crash can lose up to
    /// one interval's worth of appends.
    Periodic { interval_ms: u64 },

    /// Never fsync explicitly; rely on OS buffering. Crash loses everything
    /// not yet flushed by the kernel. Not for production use.
    NoSync,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::GroupCommit {
            max_batch_size: 1000,
            max_wait_us: 1000,
        }
    }
}

impl DurabilityLevel {
    pub fn requires_immediate_sync(&self) -> bool {
        matches!(self, Self::Synchronous)
    }

    pub fn is_no_sync(&self) -> bool {
        matches!(self, Self::NoSync)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous (fsync every append)",
            Self::GroupCommit { .. } => "group commit (shared fsync)",
            Self::Periodic { .. } => "periodic (timer-driven fsync)",
            Self::NoSync => "no-sync (testing only)",
        }
    }
}

/// How often the segmented log rolls to a new segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollCycle {
    /// Roll once per calendar day (segment name carries `YYYYMMDD`).
    Daily,
    /// Roll once per calendar hour (segment name carries `YYYYMMDDHH`).
    Hourly,
}

impl RollCycle {
    /// Format string fragment embedded in segment file names.
    pub fn name_pattern(&self) -> &'static str {
        match self {
            RollCycle::Daily => "%Y%m%d",
            RollCycle::Hourly => "%Y%m%d%H",
        }
    }
}

/// Segmented-log (queue) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Directory holding the segment files. One directory per named cache.
    pub path: PathBuf,
    /// How often the log rolls to a new segment.
    pub roll_cycle: RollCycle,
    /// Name of the durable offset table consumed by the applier.
    pub offset_table: String,
    /// Whether unapplied entries are replayed from the log on boot.
    pub replay_on_start: bool,
    /// Durability level governing fsync policy for appends.
    pub durability: DurabilityLevel,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./chronicle-data/queue"),
            roll_cycle: RollCycle::Daily,
            offset_table: "queue_offsets".to_string(),
            replay_on_start: true,
            durability: DurabilityLevel::default(),
        }
    }
}

/// Checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Interval between periodic checkpoints, in milliseconds.
    pub interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

/// Applier (consumer) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Backoff between poll attempts when the log has no new batches, in
    /// milliseconds.
    pub batch_backoff_ms: u64,
    /// Whether the applier writes a `delta_log` audit row (alongside each
    /// entry's row mutation) for entries carrying an `account_id` and an
    /// `amount`. Off by default; callers with no account-level audit
    /// requirement pay nothing for it.
    #[serde(default)]
    pub record_deltas: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { batch_backoff_ms: 50, record_deltas: false }
    }
}

/// Producer-path retry policy for durable appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Max number of append attempts before surfacing `DurableAppendFailed`.
    pub max_append_retries: u32,
    /// Backoff before the first retry, in milliseconds; doubles each attempt
    /// up to `max_backoff_ms`.
    pub initial_backoff_ms: u64,
    /// Ceiling on the exponential backoff between append retries.
    pub max_backoff_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self { max_append_retries: 5, initial_backoff_ms: 10, max_backoff_ms: 500 }
    }
}

/// Corruption-handling bounds for the recovery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionConfig {
    /// Max bytes the recovery engine skips forward per step during normal
    /// runtime tailing before it gives up and emergency-checkpoints.
    pub runtime_skip_max: u64,
    /// Max bytes the recovery engine skips forward per step during startup
    /// replay before it falls back to checkpoint-anchored rebuild.
    pub startup_skip_max: u64,
}

impl Default for CorruptionConfig {
    fn default() -> Self {
        Self {
            runtime_skip_max: 100,
            startup_skip_max: 10_000,
        }
    }
}

/// Top-level pipeline configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub corruption: CorruptionConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// A configuration tuned for tests: no-sync durability, tight skip
    /// bounds, short backoff.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            queue: QueueConfig {
                path: path.into(),
                durability: DurabilityLevel::NoSync,
                ..QueueConfig::default()
            },
            consumer: ConsumerConfig { batch_backoff_ms: 5, ..ConsumerConfig::default() },
            ..Self::default()
        }
    }
}
