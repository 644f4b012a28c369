//! Recovery Engine (C8): detects corruption on read, performs
//! progressive-skip/next-valid search, and falls back to
//! rebuild-from-database+checkpoint when the WAL is unrecoverable.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, warn};

use crate::cache::Cache;
use crate::catalog::StatementCatalog;
use crate::config::CorruptionConfig;
use crate::error::{CorruptionKind, PipelineError, Result};
use crate::log::{SegmentedLog, Tailer};
use crate::store::AdminStore;
use crate::types::{DataLossKind, DataLossRecord};

/// Which caller invoked the recovery engine; governs the skip bound and the
/// unrecoverable-case fallback (rebuild vs. emergency checkpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Startup,
    Runtime,
}

/// What the caller should do after `handle_corruption` returns.
pub enum RecoveryOutcome {
    /// A valid record was found after skipping `skipped` entries; the caller
    /// may process it directly instead of calling `read_next` again.
    Resumed { index: u64, body: Vec<u8>, skipped: u64 },
    /// Startup only: the tailer should move to just past this checkpoint's
    /// WAL index and resume replay from there.
    JumpedToCheckpoint { wal_index: u64 },
    /// Startup only: no usable checkpoint exists. The cache has already been
    /// cleared and reloaded from the relational store, the old log directory
    /// has been archived aside, and `new_log` is a fresh, empty log the
    /// caller must swap in before starting the applier.
    RebuildRequired { new_log: Arc<SegmentedLog> },
    /// Runtime only: an emergency checkpoint was written and the tailer was
    /// moved to the log's current tail; the caller should raise an alert.
    EmergencyCheckpointAndJumpToEnd,
}

const PROGRESSIVE_STEPS: [u64; 5] = [1, 10, 100, 1_000, 10_000];

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

pub struct RecoveryEngine {
    store: Arc<dyn AdminStore>,
    cache: Arc<Cache>,
    catalog: Arc<StatementCatalog>,
    config: CorruptionConfig,
}

impl RecoveryEngine {
    pub fn new(store: Arc<dyn AdminStore>, cache: Arc<Cache>, catalog: Arc<StatementCatalog>, config: CorruptionConfig) -> Self {
        Self { store, cache, catalog, config }
    }

    fn skip_bound(&self, mode: RecoveryMode) -> u64 {
        match mode {
            RecoveryMode::Startup => self.config.startup_skip_max,
            RecoveryMode::Runtime => self.config.runtime_skip_max,
        }
    }

    fn probe(&self, tailer: &mut Tailer, index: u64) -> Result<Option<(u64, Vec<u8>)>> {
        tailer.move_to(index);
        tailer.read_next()
    }

    fn record_loss(&self, loss_type: DataLossKind, start_index: u64, estimated_loss: u64, action: &str) {
        let record = DataLossRecord {
            loss_type,
            start_index,
            estimated_loss,
            recovery_action: action.to_string(),
            ts: now_unix(),
        };
        if let Err(e) = self.store.record_data_loss(&record) {
            error!(error = %e, "failed to persist data_loss record");
        }
    }

    /// Entry point invoked whenever a tailer surfaces `Corrupt{index, kind}`.
    ///
    /// In `Startup` mode this runs twice over the same corrupted region in
    /// practice: once here, warming the cache from the WAL's unapplied
    /// tail, and once more when the applier's own `Runtime` pass reaches
    /// the same index. Single-entry and forward-search skips are therefore
    /// only persisted to `data_loss` on the `Runtime` pass, which is the
    /// authoritative one; the fallbacks below (checkpoint jump, rebuild)
    /// have no `Runtime` counterpart and are always persisted.
    pub fn handle_corruption(
        &self,
        log: &Arc<SegmentedLog>,
        tailer: &mut Tailer,
        index: u64,
        kind: CorruptionKind,
        mode: RecoveryMode,
        cache_name: &str,
    ) -> Result<RecoveryOutcome> {
        error!(index, %kind, ?mode, "corruption detected in WAL, beginning recovery");

        match self.probe(tailer, index + 1) {
            Ok(Some((next_index, body))) => {
                if mode == RecoveryMode::Runtime {
                    self.record_loss(DataLossKind::SingleSkip, index, 1, "skipped single corrupted entry");
                }
                return Ok(RecoveryOutcome::Resumed { index: next_index, body, skipped: 1 });
            }
            Ok(None) => {}
            Err(PipelineError::Corrupt { .. }) => {}
            Err(e) => return Err(e),
        }

        let bound = self.skip_bound(mode);
        for &step in PROGRESSIVE_STEPS.iter() {
            if step > bound {
                break;
            }
            match self.probe(tailer, index + step) {
                Ok(Some((next_index, body))) => {
                    if mode == RecoveryMode::Runtime {
                        self.record_loss(
                            DataLossKind::ForwardSearchSkip,
                            index,
                            step,
                            &format!("forward search skipped {step} entries"),
                        );
                    }
                    return Ok(RecoveryOutcome::Resumed { index: next_index, body, skipped: step });
                }
                Ok(None) => continue,
                Err(PipelineError::Corrupt { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        match mode {
            RecoveryMode::Startup => self.startup_fallback(log, index, cache_name),
            RecoveryMode::Runtime => self.runtime_fallback(log, tailer, index, cache_name),
        }
    }

    fn startup_fallback(&self, log: &Arc<SegmentedLog>, index: u64, cache_name: &str) -> Result<RecoveryOutcome> {
        match self.store.latest_completed_checkpoint(cache_name)? {
            Some(checkpoint) if checkpoint.wal_index > index => {
                self.record_loss(
                    DataLossKind::CheckpointJump,
                    index,
                    checkpoint.wal_index.saturating_sub(index),
                    "jumped to completed checkpoint past the corruption",
                );
                Ok(RecoveryOutcome::JumpedToCheckpoint { wal_index: checkpoint.wal_index })
            }
            _ => {
                warn!(index, "no usable checkpoint; rebuilding cache from relational store");
                self.rebuild_cache_from_store()?;
                let (new_log, _report) = log.archive_and_reopen()?;
                self.record_loss(DataLossKind::Rebuild, index, 0, "rebuilt cache from relational store, archived log");
                Ok(RecoveryOutcome::RebuildRequired { new_log })
            }
        }
    }

    fn runtime_fallback(&self, log: &Arc<SegmentedLog>, tailer: &mut Tailer, index: u64, cache_name: &str) -> Result<RecoveryOutcome> {
        let entry_count = self.cache.len() as u64;
        let checksum = self.cache.canonical_checksum();
        let tail = log.last_appended_index().map(|i| i + 1).unwrap_or(0);
        let id = self.store.begin_checkpoint(cache_name, tail, entry_count)?;
        self.store.complete_checkpoint(id, "", entry_count, &checksum)?;
        tailer.move_to(tail);
        self.record_loss(
            DataLossKind::EmergencyCheckpoint,
            index,
            u64::MAX,
            "emergency checkpoint written, tailer jumped to log tail",
        );
        error!(index, "runtime corruption exceeded skip bound; jumped to log tail, raising alert");
        Ok(RecoveryOutcome::EmergencyCheckpointAndJumpToEnd)
    }

    /// Clears the cache and reloads every catalog-known table from the
    /// relational store. Used by the startup fallback and exposed for the
    /// boot sequencer's own rebuild path.
    pub fn rebuild_cache_from_store(&self) -> Result<()> {
        self.cache.clear_all();
        for (db, table) in self.catalog.known_tables() {
            let Some(catalog_entry) = self.catalog.get(&db, &table) else { continue };
            let rows = self.store.load_table(&catalog_entry).map_err(|e| PipelineError::RebuildFailed(e.to_string()))?;
            self.cache.load_rows(&db, &table, rows);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StatementCatalog;
    use crate::config::{DurabilityLevel, RollCycle};
    use crate::log::{Position, SegmentedLog};
    use crate::store::sqlite::SqliteAdminStore;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct RecordingStore {
        inner: Arc<SqliteAdminStore>,
        losses: StdMutex<Vec<DataLossRecord>>,
    }

    impl AdminStore for RecordingStore {
        fn read_offset(&self, consumer_id: &str) -> Result<Option<u64>> {
            self.inner.read_offset(consumer_id)
        }
        fn apply_batch(
            &self,
            batch: &crate::types::Batch,
            catalog: &StatementCatalog,
            consumer_id: &str,
            log_index: u64,
            record_deltas: bool,
        ) -> Result<()> {
            self.inner.apply_batch(batch, catalog, consumer_id, log_index, record_deltas)
        }
        fn record_delta(&self, record: &crate::types::DeltaRecord) -> Result<()> {
            self.inner.record_delta(record)
        }
        fn begin_checkpoint(&self, cache_name: &str, wal_index: u64, entry_count_so_far: u64) -> Result<i64> {
            self.inner.begin_checkpoint(cache_name, wal_index, entry_count_so_far)
        }
        fn complete_checkpoint(&self, id: i64, last_transaction_id: &str, entry_count: u64, body_checksum: &str) -> Result<()> {
            self.inner.complete_checkpoint(id, last_transaction_id, entry_count, body_checksum)
        }
        fn latest_completed_checkpoint(&self, cache_name: &str) -> Result<Option<crate::types::CheckpointRecord>> {
            self.inner.latest_completed_checkpoint(cache_name)
        }
        fn record_data_loss(&self, record: &DataLossRecord) -> Result<()> {
            self.losses.lock().unwrap().push(record.clone());
            self.inner.record_data_loss(record)
        }
        fn load_table(&self, entry: &crate::catalog::CatalogEntry) -> Result<Vec<(String, crate::types::DataMap)>> {
            self.inner.load_table(entry)
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<RecordingStore>, Arc<Cache>, Arc<StatementCatalog>) {
        let dir = tempdir().unwrap();
        let sqlite = Arc::new(SqliteAdminStore::open_single(dir.path().join("d1.sqlite"), "d1").unwrap());
        sqlite.execute_ddl("d1", "CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        let store = Arc::new(RecordingStore { inner: sqlite, losses: StdMutex::new(Vec::new()) });
        let cache = Arc::new(Cache::new());
        let catalog = Arc::new(StatementCatalog::empty());
        catalog.register("d1", "t", vec!["id".to_string(), "v".to_string()], "id");
        (dir, store, cache, catalog)
    }

    #[test]
    fn single_skip_resumes_at_next_record() {
        let (dir, store, cache, catalog) = setup();
        let (log, _report) = SegmentedLog::open(dir.path().join("wal"), "cache", RollCycle::Daily, DurabilityLevel::NoSync).unwrap();
        log.append(b"bad").unwrap();
        log.append(b"good").unwrap();

        let engine = RecoveryEngine::new(store.clone(), cache, catalog, CorruptionConfig::default());
        let mut tailer = log.tailer(Position::Start);
        let outcome = engine
            .handle_corruption(&log, &mut tailer, 0, CorruptionKind::ChecksumMismatch, RecoveryMode::Runtime, "cache")
            .unwrap();
        match outcome {
            RecoveryOutcome::Resumed { skipped, body, .. } => {
                assert_eq!(skipped, 1);
                assert_eq!(body, b"good");
            }
            _ => panic!("expected Resumed"),
        }
        assert_eq!(store.losses.lock().unwrap().len(), 1);
        assert_eq!(store.losses.lock().unwrap()[0].loss_type, DataLossKind::SingleSkip);
    }

    #[test]
    fn rebuild_archives_the_log_and_opens_a_fresh_one() {
        let (dir, store, cache, catalog) = setup();
        let wal_dir = dir.path().join("wal");
        let (log, _report) = SegmentedLog::open(&wal_dir, "cache", RollCycle::Daily, DurabilityLevel::NoSync).unwrap();
        log.append(b"bad").unwrap();
        log.flush().unwrap();

        // No checkpoint is registered, and the corrupted record is the last
        // one in the log, so both the single-skip probe and the bounded
        // forward search find nothing; with `startup_skip_max: 0` the search
        // loop never even starts, forcing the rebuild fallback immediately.
        let config = CorruptionConfig { runtime_skip_max: 100, startup_skip_max: 0 };
        let engine = RecoveryEngine::new(store.clone(), cache, catalog, config);
        let mut tailer = log.tailer(Position::Start);
        let outcome = engine
            .handle_corruption(&log, &mut tailer, 0, CorruptionKind::ChecksumMismatch, RecoveryMode::Startup, "cache")
            .unwrap();

        let new_log = match outcome {
            RecoveryOutcome::RebuildRequired { new_log } => new_log,
            _ => panic!("expected RebuildRequired"),
        };

        assert!(!wal_dir.exists(), "old WAL directory should have been moved aside");
        let archived: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("wal.corrupt-"))
            .collect();
        assert_eq!(archived.len(), 1, "expected exactly one archived WAL directory, found {archived:?}");

        assert_eq!(new_log.last_appended_index(), None, "the fresh log should start empty");
        let new_index = new_log.append(b"fresh").unwrap();
        assert_eq!(new_index, 0);

        let losses = store.losses.lock().unwrap();
        assert_eq!(losses.len(), 1);
        assert_eq!(losses[0].loss_type, DataLossKind::Rebuild);
    }

    #[test]
    fn rebuild_reloads_cache_from_store() {
        let (_dir, store, cache, catalog) = setup();
        let catalog_entry = catalog.get("d1", "t").unwrap();
        let mut data = BTreeMap::new();
        data.insert("id".to_string(), crate::types::Value::I64(1));
        data.insert("v".to_string(), crate::types::Value::String("x".to_string()));
        let batch = crate::types::Batch {
            transaction_id: "T".to_string(),
            timestamp: 0,
            entries: vec![crate::types::Entry { db_name: "d1".to_string(), table_name: "t".to_string(), operation: crate::types::Operation::Upsert, data }],
        };
        store.apply_batch(&batch, &catalog, "applier", 0, false).unwrap();

        let engine = RecoveryEngine::new(store, cache.clone(), catalog, CorruptionConfig::default());
        engine.rebuild_cache_from_store().unwrap();
        assert!(cache.contains(&catalog_entry.db_name, &catalog_entry.table_name, "1"));
    }
}
