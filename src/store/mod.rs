//! The administrative relational store: offsets (C3), checkpoints (C4), and
//! the data-loss log, behind a trait so the pipeline core stays generic over
//! the concrete relational engine per the out-of-scope boundary around
//! SQL-statement generation and process wiring.

pub mod sqlite;

use crate::catalog::CatalogEntry;
use crate::error::Result;
use crate::types::{Batch, CheckpointRecord, DataLossRecord, DataMap, DeltaRecord};

/// Everything the pipeline needs from the administrative relational store.
/// Implementations own connection pooling/scoped acquisition for whichever
/// databases the catalog names.
pub trait AdminStore: Send + Sync {
    /// Reads the last applied log index for `consumer_id`, called once at
    /// applier start.
    fn read_offset(&self, consumer_id: &str) -> Result<Option<u64>>;

    /// Applies every entry in `batch`, binding statements from `catalog` in
    /// declared column order, and writes the new offset in the same
    /// transaction as the data writes. Entries that reference more than one
    /// database open one transaction per database; all are committed in the
    /// same logical step (see the applier's multi-DB commit caveat). When
    /// `record_deltas` is set, any entry carrying both an `account_id` and an
    /// `amount` field also gets a `delta_log` row, written in the same
    /// per-db transaction as its row mutation.
    fn apply_batch(
        &self,
        batch: &Batch,
        catalog: &crate::catalog::StatementCatalog,
        consumer_id: &str,
        log_index: u64,
        record_deltas: bool,
    ) -> Result<()>;

    /// Records one `delta_log` row directly. Exposed on the trait for
    /// operator tooling and tests; `apply_batch` is the applier's own path.
    fn record_delta(&self, record: &DeltaRecord) -> Result<()>;

    /// Inserts an `InProgress` checkpoint row for the current log tail,
    /// returning its id.
    fn begin_checkpoint(&self, cache_name: &str, wal_index: u64, entry_count_so_far: u64) -> Result<i64>;

    /// Marks a checkpoint `Completed` with its final checksum.
    fn complete_checkpoint(
        &self,
        id: i64,
        last_transaction_id: &str,
        entry_count: u64,
        body_checksum: &str,
    ) -> Result<()>;

    /// The latest `Completed` checkpoint for `cache_name`, if any.
    fn latest_completed_checkpoint(&self, cache_name: &str) -> Result<Option<CheckpointRecord>>;

    /// Records a data-loss event for post-mortem review.
    fn record_data_loss(&self, record: &DataLossRecord) -> Result<()>;

    /// Bulk-loads every row of `(db, table)` for the boot sequencer's
    /// initial population and the recovery engine's rebuild path.
    fn load_table(&self, entry: &CatalogEntry) -> Result<Vec<(String, DataMap)>>;
}

pub const OFFSET_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS queue_offsets (\
    consumer_id TEXT PRIMARY KEY, \
    last_offset INTEGER NOT NULL\
)";

pub const CHECKPOINT_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS chronicle_checkpoint (\
    id INTEGER PRIMARY KEY AUTOINCREMENT, \
    cache_name TEXT NOT NULL, \
    checkpoint_time INTEGER NOT NULL, \
    last_transaction_id TEXT NOT NULL DEFAULT '', \
    wal_index INTEGER NOT NULL, \
    entry_count INTEGER NOT NULL DEFAULT 0, \
    body_checksum TEXT NOT NULL DEFAULT '', \
    status TEXT NOT NULL\
)";

pub const DATA_LOSS_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS chronicle_data_loss (\
    id INTEGER PRIMARY KEY AUTOINCREMENT, \
    loss_type TEXT NOT NULL, \
    start_index INTEGER NOT NULL, \
    estimated_loss INTEGER NOT NULL, \
    recovery_action TEXT NOT NULL, \
    ts INTEGER NOT NULL\
)";

pub const DELTA_LOG_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS delta_log (\
    id INTEGER PRIMARY KEY AUTOINCREMENT, \
    consumer_name TEXT NOT NULL, \
    processed_at INTEGER NOT NULL, \
    offset INTEGER NOT NULL, \
    db_name TEXT NOT NULL, \
    account_id TEXT NOT NULL, \
    amount TEXT NOT NULL\
)";
