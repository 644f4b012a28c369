//! Applier (C7): a single tailer that reads committed batches from the WAL,
//! applies each batch atomically to its target relational database(s), and
//! advances a durable offset. Never surfaces errors to clients; its sole
//! user-visible signal is the health endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::catalog::StatementCatalog;
use crate::codec;
use crate::config::ConsumerConfig;
use crate::error::{PipelineError, Result};
use crate::health::Health;
use crate::log::{Position, SegmentedLog};
use crate::recovery::{RecoveryEngine, RecoveryMode, RecoveryOutcome};
use crate::store::AdminStore;

/// Consecutive same-index failures before the applier stops advancing and
/// switches to degraded mode.
const DEGRADED_THRESHOLD: u32 = 5;

const BACKOFF_STEPS_MS: [u64; 3] = [100, 1_000, 10_000];

/// The single-threaded WAL-to-database consumer.
pub struct Applier {
    log: Arc<SegmentedLog>,
    store: Arc<dyn AdminStore>,
    catalog: Arc<StatementCatalog>,
    recovery: Arc<RecoveryEngine>,
    health: Health,
    consumer_id: String,
    cache_name: String,
    config: ConsumerConfig,
    stop: Arc<AtomicBool>,
}

impl Applier {
    pub fn new(
        log: Arc<SegmentedLog>,
        store: Arc<dyn AdminStore>,
        catalog: Arc<StatementCatalog>,
        recovery: Arc<RecoveryEngine>,
        health: Health,
        consumer_id: impl Into<String>,
        cache_name: impl Into<String>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            log,
            store,
            catalog,
            recovery,
            health,
            consumer_id: consumer_id.into(),
            cache_name: cache_name.into(),
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn health(&self) -> Health {
        self.health.clone()
    }

    /// Signals the applier's run loop to exit at the next opportunity.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Spawns the applier's background thread, returning its join handle.
    pub fn start(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }

    #[instrument(skip(self))]
    fn run(&self) {
        let start_index = match self.store.read_offset(&self.consumer_id) {
            Ok(Some(offset)) => offset + 1,
            Ok(None) => 0,
            Err(e) => {
                error!(error = %e, "failed to read starting offset; applier cannot start");
                self.health.mark_unhealthy();
                return;
            }
        };
        let mut tailer = self.log.tailer(Position::Index(start_index));
        info!(start_index, "applier starting");

        let mut consecutive_errors: u32 = 0;

        while !self.stop.load(Ordering::SeqCst) {
            match self.step(&mut tailer) {
                Ok(true) => {
                    consecutive_errors = 0;
                    self.health.mark_healthy();
                }
                Ok(false) => {
                    std::thread::sleep(Duration::from_millis(self.config.batch_backoff_ms));
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(error = %e, consecutive_errors, "applier step failed, will retry");
                    if consecutive_errors >= DEGRADED_THRESHOLD {
                        self.health.mark_degraded();
                        error!("applier entering degraded mode after repeated failures at the same index");
                    }
                    let step_idx = (consecutive_errors as usize - 1).min(BACKOFF_STEPS_MS.len() - 1);
                    std::thread::sleep(Duration::from_millis(BACKOFF_STEPS_MS[step_idx]));
                }
            }
        }
        info!("applier stopped");
    }

    /// Runs one iteration: read, decode, apply, advance offset. Returns
    /// `Ok(true)` if a batch was applied, `Ok(false)` if the tailer had
    /// nothing new.
    fn step(&self, tailer: &mut crate::log::Tailer) -> Result<bool> {
        match tailer.read_next() {
            Ok(Some((index, body))) => self.apply_record(index, &body),
            Ok(None) => Ok(false),
            Err(PipelineError::Corrupt { offset, kind }) => {
                let outcome = self.recovery.handle_corruption(
                    &self.log,
                    tailer,
                    offset,
                    kind,
                    RecoveryMode::Runtime,
                    &self.cache_name,
                )?;
                match outcome {
                    RecoveryOutcome::Resumed { index, body, skipped } => {
                        debug!(index, skipped, "resumed after skipping corrupted entries");
                        self.apply_record(index, &body)
                    }
                    RecoveryOutcome::EmergencyCheckpointAndJumpToEnd => {
                        self.health.mark_degraded();
                        Ok(false)
                    }
                    RecoveryOutcome::JumpedToCheckpoint { .. } | RecoveryOutcome::RebuildRequired { .. } => {
                        unreachable!("startup-only recovery outcomes cannot occur in runtime mode")
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    fn apply_record(&self, index: u64, body: &[u8]) -> Result<bool> {
        let batch = match codec::decode_batch(body) {
            Ok(batch) => batch,
            Err(PipelineError::Malformed { reason }) => {
                warn!(index, reason, "record failed to decode; treating as corruption");
                return Err(PipelineError::Corrupt { offset: index, kind: crate::error::CorruptionKind::BadEncoding });
            }
            Err(e) => return Err(e),
        };

        match self.store.apply_batch(&batch, &self.catalog, &self.consumer_id, index, self.config.record_deltas) {
            Ok(()) => {
                debug!(index, transaction_id = %batch.transaction_id, "applied batch");
                Ok(true)
            }
            Err(e) => {
                warn!(index, error = %e, "batch application failed, offset held");
                Err(e)
            }
        }
    }
}
