//! Universal invariants from spec.md's testable-properties section, each as
//! a direct (non-property-framework) check against the public surfaces.

mod support;

use std::collections::BTreeMap;
use std::sync::Arc;

use chronicle_pipeline::cache::Cache;
use chronicle_pipeline::catalog::StatementCatalog;
use chronicle_pipeline::codec::{decode_batch, encode_batch};
use chronicle_pipeline::log::Position;
use chronicle_pipeline::types::Decimal;
use chronicle_pipeline::{Batch, Entry, Operation, Value};
use support::*;
use tempfile::tempdir;

/// 1: durability implies visibility, including across a restart.
#[test]
fn durability_implies_visibility_across_restart() {
    let dir = tempdir().unwrap();
    let store = sqlite_store(dir.path());
    let pipeline = open_pipeline(dir.path(), store.clone(), catalog());

    for i in 0..20 {
        let result = pipeline.submit(batch(&format!("T{i}"), vec![entry(i, "v")])).unwrap();
        assert!(pipeline.contains(DB, TABLE, &i.to_string()), "batch {i} not visible right after submit returned");
        assert_eq!(result.entries_applied, 1);
    }
    pipeline.shutdown();

    // Restart: every key mutated before the crash must still be visible.
    let pipeline2 = open_pipeline(dir.path(), store, catalog());
    for i in 0..20 {
        assert!(pipeline2.contains(DB, TABLE, &i.to_string()), "batch {i} lost across restart");
    }
    pipeline2.shutdown();
}

/// 2: atomicity — a multi-table batch becomes visible as a single unit.
#[test]
fn multi_table_batch_is_atomic() {
    let dir = tempdir().unwrap();
    let store = sqlite_store(dir.path());
    store.execute_ddl("d1", "CREATE TABLE IF NOT EXISTS u (id INTEGER PRIMARY KEY, v TEXT)").unwrap();

    let cat = catalog();
    cat.register(DB, "u", vec!["id".to_string(), "v".to_string()], "id");
    let pipeline = open_pipeline(dir.path(), store, cat);

    let mut data_t = BTreeMap::new();
    data_t.insert("id".to_string(), Value::I64(1));
    data_t.insert("v".to_string(), Value::String("from-t".to_string()));
    let entry_t = Entry { db_name: DB.to_string(), table_name: TABLE.to_string(), operation: Operation::Upsert, data: data_t };

    let mut data_u = BTreeMap::new();
    data_u.insert("id".to_string(), Value::I64(1));
    data_u.insert("v".to_string(), Value::String("from-u".to_string()));
    let entry_u = Entry { db_name: DB.to_string(), table_name: "u".to_string(), operation: Operation::Upsert, data: data_u };

    pipeline.submit(batch("X", vec![entry_t, entry_u])).unwrap();

    // Both entries of the same batch must be visible, or neither.
    assert!(pipeline.contains(DB, TABLE, "1"));
    assert!(pipeline.contains(DB, "u", "1"));

    pipeline.shutdown();
}

/// 3: order preservation — sequential submits on one producer get strictly
/// increasing log indices in submission order.
#[test]
fn sequential_submits_preserve_order() {
    let dir = tempdir().unwrap();
    let store = sqlite_store(dir.path());
    let pipeline = open_pipeline(dir.path(), store, catalog());

    let mut last = None;
    for i in 0..50 {
        let result = pipeline.submit(batch(&format!("T{i}"), vec![entry(i, "v")])).unwrap();
        if let Some(prev) = last {
            assert!(result.log_index > prev, "log index did not increase: {prev} -> {}", result.log_index);
        }
        last = Some(result.log_index);
    }

    pipeline.shutdown();
}

/// 4: offset-data atomicity — after the applier catches up, re-booting
/// against the same store does not re-apply any batch (no duplicate rows,
/// no skipped batch).
#[test]
fn offset_is_not_reapplied_or_skipped_across_reboot() {
    let dir = tempdir().unwrap();
    let store = sqlite_store(dir.path());
    let cat = catalog();

    {
        let pipeline = open_pipeline(dir.path(), store.clone(), cat.clone());
        for i in 0..10 {
            pipeline.submit(batch(&format!("T{i}"), vec![entry(i, "v")])).unwrap();
        }
        let caught_up = wait_until(|| store.read_offset(CONSUMER).unwrap() == Some(9), 2_000);
        assert!(caught_up);
        pipeline.shutdown();
    }

    let offset_after_first_run = store.read_offset(CONSUMER).unwrap();

    // Reboot with no new submissions: nothing left to apply, offset unchanged.
    let pipeline2 = open_pipeline(dir.path(), store.clone(), cat);
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(store.read_offset(CONSUMER).unwrap(), offset_after_first_run);

    let entry = cat.get(DB, TABLE).unwrap();
    let rows = store.load_table(&entry).unwrap();
    assert_eq!(rows.len(), 10, "rows were duplicated or dropped across reboot");

    pipeline2.shutdown();
}

/// 5: round-trip codec, including null, decimal, and non-ASCII strings.
#[test]
fn codec_round_trips_every_value_kind() {
    let mut data = BTreeMap::new();
    data.insert("id".to_string(), Value::I64(7));
    data.insert("note".to_string(), Value::Null);
    data.insert("price".to_string(), Value::Decimal(Decimal::new(12345, 2)));
    data.insert("label".to_string(), Value::String("héllo, 世界 🌍".to_string()));
    data.insert("active".to_string(), Value::Bool(true));
    data.insert("ratio".to_string(), Value::F64(0.5));

    let original = Batch {
        transaction_id: "TXN_ROUNDTRIP".to_string(),
        timestamp: 123456,
        entries: vec![Entry { db_name: DB.to_string(), table_name: TABLE.to_string(), operation: Operation::Upsert, data }],
    };

    let encoded = encode_batch(&original);
    let decoded = decode_batch(&encoded).unwrap();
    assert_eq!(decoded, original);
}

/// 6: idempotent replay — replaying the WAL into a fresh cache from
/// scratch yields the same state as the sum of the original submits.
#[test]
fn replaying_the_log_matches_incremental_submits() {
    let dir = tempdir().unwrap();
    let queue_dir = dir.path().join("queue");
    let cat = catalog();

    let (log, live_cache, producer) = raw_producer(&queue_dir, cat.clone());
    producer.submit(batch("A", vec![entry(1, "x")])).unwrap();
    producer
        .submit(batch("B", vec![update_entry(1, "y"), delete_entry(2)]))
        .unwrap();
    producer.submit(batch("C", vec![entry(3, "z")])).unwrap();

    let mut live_rows = live_cache.iter(DB, TABLE);
    live_rows.sort_by(|a, b| a.0.cmp(&b.0));

    let replayed_cache = Cache::new();
    let mut tailer = log.tailer(Position::Start);
    while let Some((_index, body)) = tailer.read_next().unwrap() {
        let decoded = decode_batch(&body).unwrap();
        replayed_cache.apply_batch(&decoded, &cat).unwrap();
    }
    let mut replayed_rows = replayed_cache.iter(DB, TABLE);
    replayed_rows.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(live_rows, replayed_rows);
}

/// 7: corruption containment — a single corrupted record produces exactly
/// one data_loss record and the applier continues past it. Covered in full
/// end-to-end detail by `s4_single_corrupted_record_is_skipped_not_fatal`
/// in seed_scenarios.rs; this checks the recovery engine's bound directly.
#[test]
fn forward_search_finds_the_next_valid_record_beyond_a_corrupted_run() {
    use chronicle_pipeline::config::{CorruptionConfig, DurabilityLevel, RollCycle};
    use chronicle_pipeline::log::SegmentedLog;
    use chronicle_pipeline::recovery::{RecoveryEngine, RecoveryMode, RecoveryOutcome};
    use chronicle_pipeline::CorruptionKind;

    let dir = tempdir().unwrap();
    let queue_dir = dir.path().join("queue");
    let (log, _report) = SegmentedLog::open(&queue_dir, "cache", RollCycle::Daily, DurabilityLevel::NoSync).unwrap();
    for _ in 0..10 {
        log.append(b"bad").unwrap();
    }
    log.append(b"good").unwrap();
    log.flush().unwrap();

    // Corrupt indices 0..=9 so neither the single-skip probe (index+1) nor
    // the first forward-search step (also index+1) find anything valid;
    // the next step, index+10, lands exactly on the untouched record.
    for i in 0..10 {
        flip_body_byte(&queue_dir, i);
    }

    let store = sqlite_store(dir.path());
    let cache = Arc::new(Cache::new());
    let cat: Arc<StatementCatalog> = catalog();
    let store_dyn: Arc<dyn chronicle_pipeline::store::AdminStore> = store;
    let engine = RecoveryEngine::new(store_dyn, cache, cat, CorruptionConfig::default());

    let mut tailer = log.tailer(Position::Start);
    let outcome = engine
        .handle_corruption(&log, &mut tailer, 0, CorruptionKind::ChecksumMismatch, RecoveryMode::Runtime, "cache")
        .unwrap();
    match outcome {
        RecoveryOutcome::Resumed { skipped, body, .. } => {
            assert_eq!(skipped, 10);
            assert_eq!(body, b"good");
        }
        _ => panic!("expected a bounded forward-search Resumed outcome"),
    }
}
