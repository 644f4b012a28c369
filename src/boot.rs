//! Boot Sequencer (C9): orchestrates startup — integrity check, cache
//! population from the relational store, WAL replay into the cache, then
//! hands off to the applier and checkpoint timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::applier::Applier;
use crate::cache::Cache;
use crate::catalog::StatementCatalog;
use crate::codec;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::health::Health;
use crate::log::{Position, SegmentedLog};
use crate::producer::Producer;
use crate::recovery::{RecoveryEngine, RecoveryMode, RecoveryOutcome};
use crate::store::AdminStore;

/// Everything the boot sequencer produces: the process-wide singletons and
/// the running applier, ready for the caller to wire into an RPC surface.
pub struct Booted {
    pub log: Arc<SegmentedLog>,
    pub cache: Arc<Cache>,
    pub catalog: Arc<StatementCatalog>,
    pub store: Arc<dyn AdminStore>,
    pub producer: Producer,
    pub applier: Arc<Applier>,
    pub health: Health,
    checkpoint_stop: Arc<AtomicBool>,
    applier_handle: Option<std::thread::JoinHandle<()>>,
    checkpoint_handle: Option<std::thread::JoinHandle<()>>,
}

impl Booted {
    /// Stops the applier and checkpoint timer threads, in reverse
    /// construction order, and blocks until both have exited.
    pub fn shutdown(mut self) {
        self.applier.stop();
        if let Some(handle) = self.applier_handle.take() {
            let _ = handle.join();
        }
        self.checkpoint_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.checkpoint_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Runs the full boot sequence described by §4.9: integrity check, cache
/// population, WAL replay, then starts the applier and checkpoint timer.
#[instrument(skip(config, store, catalog))]
pub fn boot(
    config: &PipelineConfig,
    cache_name: &str,
    consumer_id: &str,
    store: Arc<dyn AdminStore>,
    catalog: Arc<StatementCatalog>,
) -> Result<Booted> {
    let (log, report) = SegmentedLog::open(&config.queue.path, cache_name, config.queue.roll_cycle, config.queue.durability)?;
    if report.truncated_tail_bytes > 0 {
        warn!(bytes = report.truncated_tail_bytes, "startup integrity check truncated a torn WAL tail");
    }

    let cache = Arc::new(Cache::new());
    let recovery = Arc::new(RecoveryEngine::new(store.clone(), cache.clone(), catalog.clone(), config.corruption.clone()));

    for (db, table) in catalog.known_tables() {
        let Some(catalog_entry) = catalog.get(&db, &table) else { continue };
        let rows = store.load_table(&catalog_entry)?;
        info!(db = %db, table = %table, rows = rows.len(), "loaded table into cache");
        cache.load_rows(&db, &table, rows);
    }

    let mut log = log;
    if config.queue.replay_on_start {
        let last_offset = store.read_offset(consumer_id)?;
        let replay_from = last_offset.map(|o| o + 1).unwrap_or(0);
        if let Some(new_log) = replay_into_cache(&log, &cache, &catalog, &recovery, cache_name, replay_from)? {
            log = new_log;
        }
    }

    let health = Health::new();
    let applier = Arc::new(Applier::new(
        log.clone(),
        store.clone(),
        catalog.clone(),
        recovery,
        health.clone(),
        consumer_id,
        cache_name,
        config.consumer.clone(),
    ));
    let applier_handle = applier.clone().start();

    let checkpoint_stop = Arc::new(AtomicBool::new(false));
    let checkpoint_handle = spawn_checkpoint_timer(
        store.clone(),
        cache.clone(),
        cache_name.to_string(),
        config.checkpoint.interval_ms,
        checkpoint_stop.clone(),
    );

    let producer = Producer::new(log.clone(), cache.clone(), catalog.clone(), config.producer.clone());

    info!("boot sequence complete; system ready to accept submissions");

    Ok(Booted {
        log,
        cache,
        catalog,
        store,
        producer,
        applier,
        health,
        checkpoint_stop,
        applier_handle: Some(applier_handle),
        checkpoint_handle: Some(checkpoint_handle),
    })
}

/// Replays the log from `start_index` to the tail, applying each batch to
/// the cache only (the applier re-derives DB writes from its own offset).
/// Corruption is routed through the recovery engine in startup mode.
///
/// Returns `Some(new_log)` when recovery gave up on the WAL and archived it;
/// the caller must swap `new_log` in before constructing the applier and
/// producer, since the log passed in is no longer the one on disk.
fn replay_into_cache(
    log: &Arc<SegmentedLog>,
    cache: &Arc<Cache>,
    catalog: &Arc<StatementCatalog>,
    recovery: &Arc<RecoveryEngine>,
    cache_name: &str,
    start_index: u64,
) -> Result<Option<Arc<SegmentedLog>>> {
    let mut tailer = log.tailer(Position::Index(start_index));
    let mut applied = 0u64;

    loop {
        let next = match tailer.read_next() {
            Ok(Some(pair)) => Some(pair),
            Ok(None) => None,
            Err(PipelineError::Corrupt { offset, kind }) => {
                match recovery.handle_corruption(log, &mut tailer, offset, kind, RecoveryMode::Startup, cache_name)? {
                    RecoveryOutcome::Resumed { index, body, .. } => Some((index, body)),
                    RecoveryOutcome::JumpedToCheckpoint { wal_index } => {
                        tailer.move_to(wal_index + 1);
                        continue;
                    }
                    RecoveryOutcome::RebuildRequired { new_log } => {
                        warn!("cache rebuilt from relational store during startup replay; WAL archived");
                        return Ok(Some(new_log));
                    }
                    RecoveryOutcome::EmergencyCheckpointAndJumpToEnd => {
                        unreachable!("runtime-only recovery outcome cannot occur in startup mode")
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let Some((_index, body)) = next else { break };
        let batch = codec::decode_batch(&body)?;
        cache.apply_batch(&batch, catalog)?;
        applied += 1;
    }

    info!(applied, "replayed WAL into cache");
    Ok(None)
}

fn spawn_checkpoint_timer(
    store: Arc<dyn AdminStore>,
    cache: Arc<Cache>,
    cache_name: String,
    interval_ms: u64,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(interval_ms));
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = run_checkpoint(&store, &cache, &cache_name) {
            warn!(error = %e, "periodic checkpoint failed");
        }
    })
}

fn run_checkpoint(store: &Arc<dyn AdminStore>, cache: &Arc<Cache>, cache_name: &str) -> Result<()> {
    let entry_count = cache.len() as u64;
    let id = store.begin_checkpoint(cache_name, 0, entry_count)?;
    let checksum = cache.canonical_checksum();
    store.complete_checkpoint(id, "", entry_count, &checksum)?;
    info!(entry_count, "completed periodic checkpoint");
    Ok(())
}
