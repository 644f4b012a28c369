//! A durable write-through cache sitting between an RPC frontend and one or
//! more relational databases: clients submit batches of row mutations that
//! are durably recorded in a segmented WAL, applied synchronously to a
//! unified in-memory cache for low-latency reads, and asynchronously
//! applied to the underlying relational stores with exactly-once effect
//! per batch.
//!
//! Components, leaves first: the segmented log (`log`), the WAL codec
//! (`codec`), the administrative relational store (`store`), the cache
//! (`cache`), the producer path (`producer`), the applier (`applier`), the
//! recovery engine (`recovery`), and the boot sequencer (`boot`) that wires
//! them together into a running [`Pipeline`].

pub mod applier;
pub mod boot;
pub mod cache;
pub mod catalog;
pub mod checksum;
pub mod codec;
pub mod config;
mod error;
pub mod health;
pub mod log;
pub mod producer;
pub mod recovery;
pub mod store;
pub mod types;

use std::sync::Arc;

pub use config::{DurabilityLevel, PipelineConfig, RollCycle};
pub use error::{CorruptionKind, PipelineError, Result};
pub use health::HealthStatus;
pub use producer::SubmitResult;
pub use types::{Batch, DataMap, Entry, Operation, Value};

use cache::Cache;
use catalog::StatementCatalog;
use store::AdminStore;

/// The top-level handle to a running pipeline: the process-wide log, cache,
/// catalog, and administrative store, plus the running applier and
/// checkpoint timer threads. Constructed once via [`Pipeline::open`] and
/// torn down in reverse order via [`Pipeline::shutdown`].
pub struct Pipeline {
    booted: boot::Booted,
}

impl Pipeline {
    /// Opens (or creates) a pipeline against `store`, using `catalog` to
    /// bind statements and `config` for every tunable. Runs the full boot
    /// sequence before returning: integrity check, cache population from
    /// the relational store, WAL replay, then starts the applier and
    /// checkpoint timer.
    pub fn open(
        config: &PipelineConfig,
        cache_name: &str,
        consumer_id: &str,
        store: Arc<dyn AdminStore>,
        catalog: Arc<StatementCatalog>,
    ) -> Result<Self> {
        let booted = boot::boot(config, cache_name, consumer_id, store, catalog)?;
        Ok(Self { booted })
    }

    /// Validates, durably appends, and applies a batch to the cache. See
    /// the producer path's ordering guarantee: this returns only after both
    /// the log and the cache reflect the batch.
    pub fn submit(&self, batch: Batch) -> Result<SubmitResult> {
        self.booted.producer.submit(batch)
    }

    pub fn get(&self, db: &str, table: &str, key: &str) -> Option<DataMap> {
        self.booted.cache.get(db, table, key)
    }

    pub fn contains(&self, db: &str, table: &str, key: &str) -> bool {
        self.booted.cache.contains(db, table, key)
    }

    pub fn iter(&self, db: &str, table: &str) -> Vec<(String, DataMap)> {
        self.booted.cache.iter(db, table)
    }

    pub fn last_appended_index(&self) -> Option<u64> {
        self.booted.log.last_appended_index()
    }

    /// The applier's current health: healthy, degraded, or unhealthy. The
    /// applier never surfaces errors directly; this is its sole
    /// user-visible signal.
    pub fn health(&self) -> HealthStatus {
        self.booted.health.status()
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.booted.cache
    }

    pub fn catalog(&self) -> &Arc<StatementCatalog> {
        &self.booted.catalog
    }

    /// Stops the applier and checkpoint timer, in reverse construction
    /// order, blocking until both threads have exited.
    pub fn shutdown(self) {
        self.booted.shutdown();
    }
}
