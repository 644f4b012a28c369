//! `rusqlite`-backed reference implementation of [`AdminStore`].
//!
//! One connection per named database, each guarded by its own mutex so the
//! applier can hold distinct transactions open concurrently across
//! databases referenced by the same batch. The administrative tables
//! (offsets, checkpoints, data loss) live in one designated connection; when
//! that connection coincides with a batch's primary database the offset
//! write is genuinely atomic with the data writes, otherwise it is a
//! best-effort sequential commit (see the multi-DB commit caveat).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use tracing::{instrument, warn};

use crate::catalog::{CatalogEntry, StatementCatalog};
use crate::error::{PipelineError, Result};
use crate::store::{AdminStore, CHECKPOINT_TABLE_DDL, DATA_LOSS_TABLE_DDL, DELTA_LOG_TABLE_DDL, OFFSET_TABLE_DDL};
use crate::types::{Batch, CheckpointRecord, CheckpointStatus, DataLossRecord, DataMap, Decimal, DeltaRecord, Value};

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match value {
        Value::Null => SqlValue::Null,
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::I64(v) => SqlValue::Integer(*v),
        Value::F64(v) => SqlValue::Real(*v),
        Value::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        Value::Decimal(d) => SqlValue::Text(d.to_string()),
    }
}

fn from_sql_row(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<DataMap> {
    let mut data = DataMap::new();
    for (i, col) in columns.iter().enumerate() {
        let v: rusqlite::types::Value = row.get(i)?;
        let value = match v {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(n) => Value::I64(n),
            rusqlite::types::Value::Real(f) => Value::F64(f),
            rusqlite::types::Value::Text(s) => Value::String(s),
            rusqlite::types::Value::Blob(_) => Value::Null,
        };
        data.insert(col.clone(), value);
    }
    Ok(data)
}

fn checkpoint_status_str(status: CheckpointStatus) -> &'static str {
    match status {
        CheckpointStatus::InProgress => "InProgress",
        CheckpointStatus::Completed => "Completed",
        CheckpointStatus::Failed => "Failed",
    }
}

fn parse_checkpoint_status(s: &str) -> CheckpointStatus {
    match s {
        "Completed" => CheckpointStatus::Completed,
        "Failed" => CheckpointStatus::Failed,
        _ => CheckpointStatus::InProgress,
    }
}

/// A `rusqlite` connection manager keyed by logical database name.
pub struct SqliteAdminStore {
    admin_db: String,
    connections: DashMap<String, Mutex<Connection>>,
}

impl SqliteAdminStore {
    /// Opens (creating as needed) one SQLite file per entry in `db_paths`,
    /// designating `admin_db` as the database that carries the offset,
    /// checkpoint, and data-loss tables.
    pub fn open(admin_db: impl Into<String>, db_paths: HashMap<String, PathBuf>) -> Result<Self> {
        let connections = DashMap::new();
        for (name, path) in db_paths {
            let conn = open_connection(&path)?;
            connections.insert(name, Mutex::new(conn));
        }
        let admin_db = admin_db.into();
        if let Some(conn) = connections.get(&admin_db) {
            let conn = conn.lock();
            conn.execute(OFFSET_TABLE_DDL, [])?;
            conn.execute(CHECKPOINT_TABLE_DDL, [])?;
            conn.execute(DATA_LOSS_TABLE_DDL, [])?;
            conn.execute(DELTA_LOG_TABLE_DDL, [])?;
        } else {
            return Err(PipelineError::DatabaseNotFound(admin_db));
        }
        Ok(Self { admin_db, connections })
    }

    /// Opens a single-database store, typically used in tests where the
    /// admin tables and the application tables share one file.
    pub fn open_single(path: impl AsRef<Path>, db_name: impl Into<String>) -> Result<Self> {
        let db_name = db_name.into();
        let mut map = HashMap::new();
        map.insert(db_name.clone(), path.as_ref().to_path_buf());
        Self::open(db_name, map)
    }

    fn connection(&self, db_name: &str) -> Result<dashmap::mapref::one::Ref<'_, String, Mutex<Connection>>> {
        self.connections.get(db_name).ok_or_else(|| PipelineError::DatabaseNotFound(db_name.to_string()))
    }

    /// Runs arbitrary DDL against one of the managed databases; used by
    /// callers to create application tables before submitting batches.
    pub fn execute_ddl(&self, db_name: &str, ddl: &str) -> Result<()> {
        let conn = self.connection(db_name)?;
        conn.lock().execute(ddl, [])?;
        Ok(())
    }

    /// Reads every `chronicle_data_loss` row, oldest first. Used by
    /// operator tooling and tests to inspect what the recovery engine did.
    pub fn list_data_loss(&self) -> Result<Vec<DataLossRecord>> {
        let conn = self.connection(&self.admin_db)?;
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT loss_type, start_index, estimated_loss, recovery_action, ts FROM chronicle_data_loss ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DataLossRecord {
                loss_type: parse_data_loss_kind(&row.get::<_, String>(0)?),
                start_index: row.get::<_, i64>(1)? as u64,
                estimated_loss: row.get::<_, i64>(2)? as u64,
                recovery_action: row.get(3)?,
                ts: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn parse_data_loss_kind(s: &str) -> crate::types::DataLossKind {
    use crate::types::DataLossKind;
    match s {
        "ForwardSearchSkip" => DataLossKind::ForwardSearchSkip,
        "CheckpointJump" => DataLossKind::CheckpointJump,
        "Rebuild" => DataLossKind::Rebuild,
        "EmergencyCheckpoint" => DataLossKind::EmergencyCheckpoint,
        _ => DataLossKind::SingleSkip,
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Pulls `(account_id, amount)` out of an entry's data, if both fields are
/// present and `amount` is a decimal. Entries without this shape simply
/// don't get a `delta_log` row.
fn delta_for_entry(entry: &crate::types::Entry) -> Option<(String, Decimal)> {
    let account_id = entry.data.get("account_id").map(crate::types::canonical_key)?;
    let amount = match entry.data.get("amount")? {
        Value::Decimal(d) => *d,
        _ => return None,
    };
    Some((account_id, amount))
}

fn bind_values_for(entry: &crate::types::Entry, catalog_entry: &CatalogEntry) -> Vec<rusqlite::types::Value> {
    match entry.operation {
        crate::types::Operation::Insert | crate::types::Operation::Upsert => catalog_entry
            .columns
            .iter()
            .map(|c| to_sql_value(entry.data.get(c).unwrap_or(&Value::Null)))
            .collect(),
        crate::types::Operation::Update => {
            let mut values: Vec<rusqlite::types::Value> = catalog_entry
                .update_columns()
                .map(|c| to_sql_value(entry.data.get(c).unwrap_or(&Value::Null)))
                .collect();
            values.push(to_sql_value(entry.data.get(&catalog_entry.primary_key).unwrap_or(&Value::Null)));
            values
        }
        crate::types::Operation::Delete => {
            vec![to_sql_value(entry.data.get(&catalog_entry.primary_key).unwrap_or(&Value::Null))]
        }
    }
}

impl AdminStore for SqliteAdminStore {
    fn read_offset(&self, consumer_id: &str) -> Result<Option<u64>> {
        let conn = self.connection(&self.admin_db)?;
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT last_offset FROM queue_offsets WHERE consumer_id = ?1")?;
        let mut rows = stmt.query([consumer_id])?;
        if let Some(row) = rows.next()? {
            let offset: i64 = row.get(0)?;
            Ok(Some(offset as u64))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self, batch, catalog))]
    fn apply_batch(
        &self,
        batch: &Batch,
        catalog: &StatementCatalog,
        consumer_id: &str,
        log_index: u64,
        record_deltas: bool,
    ) -> Result<()> {
        let mut by_db: HashMap<String, Vec<&crate::types::Entry>> = HashMap::new();
        for entry in &batch.entries {
            by_db.entry(entry.db_name.clone()).or_default().push(entry);
        }

        let mut locks = Vec::new();
        for db_name in by_db.keys() {
            locks.push((db_name.clone(), self.connection(db_name)?));
        }

        let mut guards: Vec<(String, parking_lot::MutexGuard<'_, Connection>)> =
            locks.iter().map(|(name, conn)| (name.clone(), conn.lock())).collect();

        let now = now_unix();
        for (db_name, conn) in guards.iter_mut() {
            let entries = &by_db[db_name];
            let tx = conn.transaction()?;
            for entry in entries.iter() {
                let Some(catalog_entry) = catalog.get(&entry.db_name, &entry.table_name) else {
                    return Err(PipelineError::TableNotFound(format!("{}.{}", entry.db_name, entry.table_name)));
                };
                let stmt_sql = catalog_entry.statement_for(entry.operation).to_string();
                let values = bind_values_for(entry, &catalog_entry);
                tx.execute(&stmt_sql, params_from_iter(values))?;
            }
            if db_name == &self.admin_db {
                tx.execute(
                    "INSERT INTO queue_offsets (consumer_id, last_offset) VALUES (?1, ?2) \
                     ON CONFLICT(consumer_id) DO UPDATE SET last_offset = excluded.last_offset",
                    rusqlite::params![consumer_id, log_index as i64],
                )?;

                // delta_log lives only in the admin database, same as the
                // offset/checkpoint/data-loss tables, so it can only be
                // written atomically with the entries that land here too.
                if record_deltas {
                    for entry in entries.iter() {
                        if let Some((account_id, amount)) = delta_for_entry(entry) {
                            tx.execute(
                                "INSERT INTO delta_log (consumer_name, processed_at, offset, db_name, account_id, amount) \
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                                rusqlite::params![consumer_id, now, log_index as i64, db_name, account_id, amount.to_string()],
                            )?;
                        }
                    }
                }
            }
            tx.commit()?;
        }

        if !by_db.contains_key(&self.admin_db) {
            warn!(
                consumer_id,
                log_index, "batch did not touch the admin database; offset committed in a separate transaction"
            );
            let admin_conn = self.connection(&self.admin_db)?;
            let admin_conn = admin_conn.lock();
            admin_conn.execute(
                "INSERT INTO queue_offsets (consumer_id, last_offset) VALUES (?1, ?2) \
                 ON CONFLICT(consumer_id) DO UPDATE SET last_offset = excluded.last_offset",
                rusqlite::params![consumer_id, log_index as i64],
            )?;
        }

        Ok(())
    }

    fn begin_checkpoint(&self, cache_name: &str, wal_index: u64, entry_count_so_far: u64) -> Result<i64> {
        let conn = self.connection(&self.admin_db)?;
        let conn = conn.lock();
        let now = now_unix();
        conn.execute(
            "INSERT INTO chronicle_checkpoint (cache_name, checkpoint_time, wal_index, entry_count, status) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                cache_name,
                now,
                wal_index as i64,
                entry_count_so_far as i64,
                checkpoint_status_str(CheckpointStatus::InProgress)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_checkpoint(&self, id: i64, last_transaction_id: &str, entry_count: u64, body_checksum: &str) -> Result<()> {
        let conn = self.connection(&self.admin_db)?;
        let conn = conn.lock();
        conn.execute(
            "UPDATE chronicle_checkpoint SET status = ?1, last_transaction_id = ?2, entry_count = ?3, body_checksum = ?4 WHERE id = ?5",
            rusqlite::params![
                checkpoint_status_str(CheckpointStatus::Completed),
                last_transaction_id,
                entry_count as i64,
                body_checksum,
                id
            ],
        )?;
        Ok(())
    }

    fn latest_completed_checkpoint(&self, cache_name: &str) -> Result<Option<CheckpointRecord>> {
        let conn = self.connection(&self.admin_db)?;
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, cache_name, checkpoint_time, last_transaction_id, wal_index, entry_count, body_checksum, status \
             FROM chronicle_checkpoint WHERE cache_name = ?1 AND status = 'Completed' ORDER BY checkpoint_time DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([cache_name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(CheckpointRecord {
                id: row.get(0)?,
                cache_name: row.get(1)?,
                checkpoint_time: row.get(2)?,
                last_transaction_id: row.get(3)?,
                wal_index: row.get::<_, i64>(4)? as u64,
                entry_count: row.get::<_, i64>(5)? as u64,
                body_checksum: row.get(6)?,
                status: parse_checkpoint_status(&row.get::<_, String>(7)?),
            }))
        } else {
            Ok(None)
        }
    }

    fn record_data_loss(&self, record: &DataLossRecord) -> Result<()> {
        let conn = self.connection(&self.admin_db)?;
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO chronicle_data_loss (loss_type, start_index, estimated_loss, recovery_action, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                format!("{:?}", record.loss_type),
                record.start_index as i64,
                record.estimated_loss as i64,
                record.recovery_action,
                record.ts
            ],
        )?;
        Ok(())
    }

    fn record_delta(&self, record: &DeltaRecord) -> Result<()> {
        let conn = self.connection(&self.admin_db)?;
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO delta_log (consumer_name, processed_at, offset, db_name, account_id, amount) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.consumer_name,
                record.processed_at,
                record.offset as i64,
                record.db_name,
                record.account_id,
                record.amount.to_string()
            ],
        )?;
        Ok(())
    }

    fn load_table(&self, entry: &CatalogEntry) -> Result<Vec<(String, DataMap)>> {
        let conn = self.connection(&entry.db_name)?;
        let conn = conn.lock();
        let col_list = entry.columns.join(", ");
        let sql = format!("SELECT {col_list} FROM {}", entry.table_name);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| from_sql_row(row, &entry.columns))?;
        let mut out = Vec::new();
        for row in rows {
            let data = row?;
            let key = data
                .get(&entry.primary_key)
                .map(crate::types::canonical_key)
                .unwrap_or_default();
            out.push((key, data));
        }
        Ok(out)
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
