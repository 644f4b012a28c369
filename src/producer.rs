//! Producer Path (C6): validates a submitted batch, durably appends it, then
//! mutates the cache. `submit` returns only after both the log and the
//! cache reflect the batch, so any later read on this process observes it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{instrument, warn};

use crate::cache::Cache;
use crate::catalog::StatementCatalog;
use crate::codec;
use crate::config::ProducerConfig;
use crate::error::{PipelineError, Result};
use crate::log::SegmentedLog;
use crate::types::Batch;

/// The outcome of a successful `submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub transaction_id: String,
    pub log_index: u64,
    pub entries_applied: usize,
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn generate_transaction_id() -> String {
    let token: u64 = rand::thread_rng().gen();
    format!("TXN_{}_{:016x}", now_millis(), token)
}

/// Validates a submitted batch against the catalog's declared primary keys.
/// Rejects with `EmptyBatch` or `InvalidEntry{index, reason}`; never touches
/// the log or the cache.
fn validate(batch: &mut Batch, catalog: &StatementCatalog) -> Result<()> {
    if batch.entries.is_empty() {
        return Err(PipelineError::EmptyBatch);
    }
    for (index, entry) in batch.entries.iter().enumerate() {
        if entry.db_name.is_empty() {
            return Err(PipelineError::InvalidEntry { index, reason: "db_name is empty".to_string() });
        }
        if entry.table_name.is_empty() {
            return Err(PipelineError::InvalidEntry { index, reason: "table_name is empty".to_string() });
        }
        if let Some(catalog_entry) = catalog.get(&entry.db_name, &entry.table_name) {
            if !entry.data.contains_key(&catalog_entry.primary_key) {
                return Err(PipelineError::InvalidEntry {
                    index,
                    reason: format!("missing primary key column '{}'", catalog_entry.primary_key),
                });
            }
        }
    }
    if batch.transaction_id.is_empty() {
        batch.transaction_id = generate_transaction_id();
    }
    Ok(())
}

/// Durably appends an encoded batch body, retrying `Io` failures with
/// exponential backoff up to `config.max_append_retries`.
fn append_with_retry(log: &Arc<SegmentedLog>, body: &[u8], config: &ProducerConfig) -> Result<u64> {
    let mut backoff_ms = config.initial_backoff_ms;
    let mut attempt = 0;
    loop {
        match log.append(body) {
            Ok(index) => return Ok(index),
            Err(PipelineError::Io(e)) => {
                attempt += 1;
                if attempt >= config.max_append_retries {
                    return Err(PipelineError::DurableAppendFailed(e.to_string()));
                }
                warn!(attempt, error = %e, "durable append failed, retrying");
                std::thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms = (backoff_ms * 2).min(config.max_backoff_ms);
            }
            Err(e) => return Err(e),
        }
    }
}

/// The producer path: validate, durably append, then apply to cache.
pub struct Producer {
    log: Arc<SegmentedLog>,
    cache: Arc<Cache>,
    catalog: Arc<StatementCatalog>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(log: Arc<SegmentedLog>, cache: Arc<Cache>, catalog: Arc<StatementCatalog>, config: ProducerConfig) -> Self {
        Self { log, cache, catalog, config }
    }

    #[instrument(skip(self, batch))]
    pub fn submit(&self, mut batch: Batch) -> Result<SubmitResult> {
        validate(&mut batch, &self.catalog)?;

        let body = codec::encode_batch(&batch);
        let log_index = append_with_retry(&self.log, &body, &self.config)?;

        let entries_applied = self.cache.apply_batch(&batch, &self.catalog)?;

        Ok(SubmitResult { transaction_id: batch.transaction_id, log_index, entries_applied })
    }
}
