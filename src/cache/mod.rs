//! Cache storage (C5): one process-wide keyed store, `(db, table, key) ->
//! row`, authoritative rather than LRU-evicted so a multi-table batch can
//! become visible as a single, atomic swap after the WAL append returns.
//!
//! A single unified map (rather than one map per table) is deliberate: it
//! lets a batch spanning several tables become visible under one critical
//! section. Writers serialise on a per-`(db, table)` lock, escalating to a
//! process-wide exclusion when a batch spans more than one table; readers
//! never block.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::catalog::StatementCatalog;
use crate::error::Result;
use crate::types::{canonical_key, Batch, CacheKey, DataMap, Operation};

#[derive(Default)]
struct Stats {
    applied: std::sync::atomic::AtomicU64,
    update_misses: std::sync::atomic::AtomicU64,
}

/// Process-wide keyed cache store.
pub struct Cache {
    rows: DashMap<CacheKey, DataMap>,
    table_locks: DashMap<(String, String), Arc<Mutex<()>>>,
    global: RwLock<()>,
    stats: Stats,
}

impl Cache {
    pub fn new() -> Self {
        Self { rows: DashMap::new(), table_locks: DashMap::new(), global: RwLock::new(()), stats: Stats::default() }
    }

    fn table_lock(&self, db: &str, table: &str) -> Arc<Mutex<()>> {
        self.table_locks
            .entry((db.to_string(), table.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Applies one entry. `Insert`/`Upsert` put the row; `Update` replaces it
    /// (a missing key is logged as a warning, not an error — the WAL remains
    /// authoritative); `Delete` removes the key.
    fn apply_locked(&self, db: &str, table: &str, operation: Operation, pk: String, data: DataMap) {
        let key: CacheKey = (db.to_string(), table.to_string(), pk);
        match operation {
            Operation::Insert | Operation::Upsert => {
                self.rows.insert(key, data);
            }
            Operation::Update => {
                if self.rows.contains_key(&key) {
                    self.rows.insert(key, data);
                } else {
                    self.stats.update_misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!(db, table, "update targeted a key absent from the cache");
                }
            }
            Operation::Delete => {
                self.rows.remove(&key);
            }
        }
        self.stats.applied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Applies every entry in `batch` under a single critical section so
    /// observers never see a partial batch. `catalog` supplies each entry's
    /// primary-key column.
    pub fn apply_batch(&self, batch: &Batch, catalog: &StatementCatalog) -> Result<usize> {
        let tables: HashSet<(String, String)> =
            batch.entries.iter().map(|e| (e.db_name.clone(), e.table_name.clone())).collect();

        if tables.len() > 1 {
            let _global_guard = self.global.write();
            return Ok(self.apply_entries(batch, catalog));
        }

        let _global_guard = self.global.read();
        if let Some((db, table)) = tables.iter().next() {
            let table_lock = self.table_lock(db, table);
            let _held = table_lock.lock();
            return Ok(self.apply_entries(batch, catalog));
        }
        Ok(0)
    }

    fn apply_entries(&self, batch: &Batch, catalog: &StatementCatalog) -> usize {
        let mut applied = 0;
        for entry in &batch.entries {
            let pk = match catalog.get(&entry.db_name, &entry.table_name) {
                Some(cat_entry) => cat_entry.primary_key,
                None => {
                    warn!(db = %entry.db_name, table = %entry.table_name, "no catalog entry; skipping cache apply");
                    continue;
                }
            };
            let Some(pk_value) = entry.data.get(&pk) else {
                warn!(db = %entry.db_name, table = %entry.table_name, "entry missing primary key value; skipping cache apply");
                continue;
            };
            let pk_str = canonical_key(pk_value);
            self.apply_locked(&entry.db_name, &entry.table_name, entry.operation, pk_str, entry.data.clone());
            applied += 1;
        }
        applied
    }

    pub fn get(&self, db: &str, table: &str, key: &str) -> Option<DataMap> {
        self.rows.get(&(db.to_string(), table.to_string(), key.to_string())).map(|r| r.clone())
    }

    pub fn contains(&self, db: &str, table: &str, key: &str) -> bool {
        self.rows.contains_key(&(db.to_string(), table.to_string(), key.to_string()))
    }

    /// Snapshots every row currently held for `(db, table)`.
    pub fn iter(&self, db: &str, table: &str) -> Vec<(String, DataMap)> {
        self.rows
            .iter()
            .filter(|entry| entry.key().0 == db && entry.key().1 == table)
            .map(|entry| (entry.key().2.clone(), entry.value().clone()))
            .collect()
    }

    /// Bulk-loads rows for `(db, table)` without touching the WAL, used by
    /// the boot sequencer and by lazy population on a cache miss.
    pub fn load_rows(&self, db: &str, table: &str, rows: impl IntoIterator<Item = (String, DataMap)>) {
        let _global_guard = self.global.read();
        let lock = self.table_lock(db, table);
        let _held = lock.lock();
        for (key, data) in rows {
            self.rows.insert((db.to_string(), table.to_string(), key), data);
        }
    }

    /// Removes every row for `(db, table)`, used by the recovery engine's
    /// rebuild-from-database path.
    pub fn clear_table(&self, db: &str, table: &str) {
        let _global_guard = self.global.write();
        self.rows.retain(|k, _| !(k.0 == db && k.1 == table));
    }

    /// Clears every row in the cache. Used before a full rebuild.
    pub fn clear_all(&self) {
        let _global_guard = self.global.write();
        self.rows.clear();
    }

    /// A stable, sorted snapshot of `(db, table, key, data)` tuples, used by
    /// the checkpoint store to compute a rolling body checksum.
    pub fn canonical_snapshot(&self) -> Vec<(CacheKey, DataMap)> {
        let mut snapshot: Vec<(CacheKey, DataMap)> =
            self.rows.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// A CRC32C checksum over the canonical snapshot, used by the
    /// checkpointer and the recovery engine's emergency checkpoint path as
    /// a cheap consistency fingerprint.
    pub fn canonical_checksum(&self) -> String {
        let snapshot = self.canonical_snapshot();
        let rendered = format!("{snapshot:?}");
        format!("{:08x}", crate::checksum::compute(rendered.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
