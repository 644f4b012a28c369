//! The literal seed scenarios S1-S6: fixed inputs, fixed expectations,
//! exercised against the public `Pipeline` surface end to end.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use chronicle_pipeline::PipelineError;
use support::*;
use tempfile::tempdir;

#[test]
fn s1_single_upsert_is_visible_immediately() {
    let dir = tempdir().unwrap();
    let store = sqlite_store(dir.path());
    let pipeline = open_pipeline(dir.path(), store, catalog());

    let result = pipeline.submit(batch("A", vec![entry(1, "x")])).unwrap();
    assert_eq!(result.log_index, 0);
    assert_eq!(result.entries_applied, 1);

    let row = pipeline.get(DB, TABLE, "1").unwrap();
    assert_eq!(row.get("v").unwrap().as_str(), Some("x"));

    pipeline.shutdown();
}

#[test]
fn s2_update_and_delete_in_one_batch() {
    let dir = tempdir().unwrap();
    let store = sqlite_store(dir.path());
    let pipeline = open_pipeline(dir.path(), store, catalog());

    pipeline.submit(batch("A", vec![entry(1, "x")])).unwrap();
    let result = pipeline
        .submit(batch("B", vec![update_entry(1, "y"), delete_entry(2)]))
        .unwrap();
    assert_eq!(result.log_index, 1);
    assert_eq!(result.entries_applied, 2);

    let row = pipeline.get(DB, TABLE, "1").unwrap();
    assert_eq!(row.get("v").unwrap().as_str(), Some("y"));
    assert!(!pipeline.contains(DB, TABLE, "2"));

    pipeline.shutdown();
}

#[test]
fn s3_cache_and_offset_survive_restart() {
    let dir = tempdir().unwrap();
    let queue_dir = dir.path().join("queue");
    let cat = catalog();

    // Submit S1 + S2 with no applier running, then "crash" by dropping
    // everything without a clean shutdown.
    {
        let (_log, _cache, producer) = raw_producer(&queue_dir, cat.clone());
        producer.submit(batch("A", vec![entry(1, "x")])).unwrap();
        producer
            .submit(batch("B", vec![update_entry(1, "y"), delete_entry(2)]))
            .unwrap();
    }

    let store = sqlite_store(dir.path());
    let pipeline = open_pipeline(dir.path(), store.clone(), cat);

    let row = pipeline.get(DB, TABLE, "1").unwrap();
    assert_eq!(row.get("v").unwrap().as_str(), Some("y"));
    assert!(!pipeline.contains(DB, TABLE, "2"));

    let caught_up = wait_until(|| store.read_offset(CONSUMER).unwrap() == Some(1), 2_000);
    assert!(caught_up, "applier never caught up to the last committed batch's log index");

    pipeline.shutdown();
}

#[test]
fn s4_single_corrupted_record_is_skipped_not_fatal() {
    let dir = tempdir().unwrap();
    let queue_dir = dir.path().join("queue");
    let cat = catalog();

    {
        let (log, _cache, producer) = raw_producer(&queue_dir, cat.clone());
        producer.submit(batch("A", vec![entry(1, "one")])).unwrap();
        producer.submit(batch("B", vec![entry(2, "two")])).unwrap();
        producer.submit(batch("C", vec![entry(3, "three")])).unwrap();
        log.flush().unwrap();
    }

    flip_body_byte(&queue_dir, 1);

    let store = sqlite_store(dir.path());
    let pipeline = open_pipeline(dir.path(), store.clone(), cat);

    assert!(pipeline.contains(DB, TABLE, "1"));
    assert!(!pipeline.contains(DB, TABLE, "2"));
    assert!(pipeline.contains(DB, TABLE, "3"));

    // The cache above is warmed synchronously during boot; the data_loss row
    // is written by the applier's own (asynchronous) pass over the same gap.
    let caught_up = wait_until(|| !store.list_data_loss().unwrap().is_empty(), 2_000);
    assert!(caught_up, "applier never recorded the corruption it should have hit");

    let losses = store.list_data_loss().unwrap();
    assert_eq!(losses.len(), 1, "expected exactly one data_loss row, got {losses:?}");
    assert_eq!(losses[0].start_index, 1);
    assert!(losses[0].estimated_loss >= 1);

    pipeline.shutdown();
}

#[test]
fn s5_empty_batch_is_rejected() {
    let dir = tempdir().unwrap();
    let store = sqlite_store(dir.path());
    let pipeline = open_pipeline(dir.path(), store, catalog());

    let before = pipeline.last_appended_index();
    let err = pipeline.submit(batch("C", vec![])).unwrap_err();
    assert!(matches!(err, PipelineError::EmptyBatch));
    assert_eq!(pipeline.last_appended_index(), before);

    pipeline.shutdown();
}

#[test]
fn s6_concurrent_submits_from_eight_threads_all_land() {
    let dir = tempdir().unwrap();
    let store = sqlite_store(dir.path());
    let pipeline = Arc::new(open_pipeline(dir.path(), store.clone(), catalog()));

    let first = pipeline.last_appended_index().map(|i| i + 1).unwrap_or(0);
    let counter = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let pipeline = pipeline.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for i in 0..125 {
                    let id = t * 125 + i;
                    let tx = format!("T{t}-{i}");
                    pipeline.submit(batch(&tx, vec![entry(id, "v")])).unwrap();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), 1_000);
    assert_eq!(pipeline.last_appended_index(), Some(first + 999));

    let caught_up = wait_until(|| store.read_offset(CONSUMER).unwrap() == Some(first + 999), 5_000);
    assert!(caught_up, "applier did not catch up to the final log index");

    for t in 0..8u64 {
        for i in 0..125u64 {
            let id = t * 125 + i;
            assert!(pipeline.contains(DB, TABLE, &id.to_string()));
        }
    }

    Arc::try_unwrap(pipeline).map_err(|_| ()).expect("no other owners left").shutdown();
}
