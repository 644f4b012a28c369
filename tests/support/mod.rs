//! Shared helpers for the integration suite: a one-table pipeline wired
//! against a throwaway SQLite admin store, plus raw WAL file access for
//! corruption-injection tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chronicle_pipeline::cache::Cache;
use chronicle_pipeline::catalog::StatementCatalog;
use chronicle_pipeline::config::{DurabilityLevel, PipelineConfig, ProducerConfig, RollCycle};
use chronicle_pipeline::log::SegmentedLog;
use chronicle_pipeline::producer::Producer;
use chronicle_pipeline::store::sqlite::SqliteAdminStore;
use chronicle_pipeline::store::AdminStore;
use chronicle_pipeline::{Batch, Entry, Operation, Pipeline, Value};

pub const DB: &str = "d1";
pub const TABLE: &str = "t";
pub const CONSUMER: &str = "test-applier";

pub fn catalog() -> Arc<StatementCatalog> {
    let catalog = StatementCatalog::empty();
    catalog.register(DB, TABLE, vec!["id".to_string(), "v".to_string()], "id");
    Arc::new(catalog)
}

pub fn sqlite_store(dir: &Path) -> Arc<SqliteAdminStore> {
    let store = SqliteAdminStore::open_single(dir.join("admin.sqlite"), DB).unwrap();
    store.execute_ddl(DB, "CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    Arc::new(store)
}

pub fn open_pipeline(dir: &Path, store: Arc<SqliteAdminStore>, catalog: Arc<StatementCatalog>) -> Pipeline {
    let config = PipelineConfig::for_testing(dir.join("queue"));
    let store: Arc<dyn AdminStore> = store;
    Pipeline::open(&config, "cache", CONSUMER, store, catalog).unwrap()
}

/// Builds a producer directly over a fresh log and cache, with no applier
/// running, so a test can submit batches and inspect/corrupt the WAL before
/// anything else has read it. Simulates "submit, then crash before the
/// applier catches up".
pub fn raw_producer(queue_dir: &Path, catalog: Arc<StatementCatalog>) -> (Arc<SegmentedLog>, Arc<Cache>, Producer) {
    let (log, _report) = SegmentedLog::open(queue_dir, "cache", RollCycle::Daily, DurabilityLevel::NoSync).unwrap();
    let cache = Arc::new(Cache::new());
    let producer = Producer::new(log.clone(), cache.clone(), catalog, ProducerConfig::default());
    (log, cache, producer)
}

pub fn entry(id: i64, v: &str) -> Entry {
    let mut data = BTreeMap::new();
    data.insert("id".to_string(), Value::I64(id));
    data.insert("v".to_string(), Value::String(v.to_string()));
    Entry { db_name: DB.to_string(), table_name: TABLE.to_string(), operation: Operation::Upsert, data }
}

pub fn delete_entry(id: i64) -> Entry {
    let mut data = BTreeMap::new();
    data.insert("id".to_string(), Value::I64(id));
    Entry { db_name: DB.to_string(), table_name: TABLE.to_string(), operation: Operation::Delete, data }
}

pub fn update_entry(id: i64, v: &str) -> Entry {
    let mut e = entry(id, v);
    e.operation = Operation::Update;
    e
}

pub fn batch(tx: &str, entries: Vec<Entry>) -> Batch {
    Batch { transaction_id: tx.to_string(), timestamp: 0, entries }
}

/// The single `.seg` file under a queue directory that has never rolled.
pub fn only_segment_path(queue_dir: &Path) -> PathBuf {
    let mut segs: Vec<PathBuf> = std::fs::read_dir(queue_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "seg").unwrap_or(false))
        .collect();
    assert_eq!(segs.len(), 1, "expected exactly one WAL segment, found {}", segs.len());
    segs.pop().unwrap()
}

/// Flips one byte in the body of the `target_index`-th record (0-based) of
/// the only segment under `queue_dir`. Must be called while nothing holds
/// the log open (i.e. after the owning `Pipeline` has been shut down).
pub fn flip_body_byte(queue_dir: &Path, target_index: usize) {
    use chronicle_pipeline::log::record::{parse, HEADER_LEN};

    let path = only_segment_path(queue_dir);
    let mut bytes = std::fs::read(&path).unwrap();

    let mut offset = 0usize;
    for i in 0..=target_index {
        let consumed = parse(&bytes[offset..], offset as u64).unwrap().consumed;
        if i == target_index {
            let body_start = offset + HEADER_LEN;
            bytes[body_start] ^= 0xFF;
            std::fs::write(&path, &bytes).unwrap();
            return;
        }
        offset += consumed;
    }
    panic!("segment has fewer than {} records", target_index + 1);
}

/// Waits (bounded) until `poll` returns true, polling on a short interval.
/// Used to observe the applier's asynchronous effects without a fixed sleep.
pub fn wait_until(mut poll: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let start = std::time::Instant::now();
    loop {
        if poll() {
            return true;
        }
        if start.elapsed().as_millis() as u64 > timeout_ms {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}
