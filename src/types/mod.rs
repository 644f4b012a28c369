//! Core data model: entries, batches, and the typed value union that flows
//! from the RPC surface through the log, the cache, and the applier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fixed-point decimal, canonicalised as `unscaled * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decimal {
    pub scale: i32,
    pub unscaled: i128,
}

impl Decimal {
    pub fn new(unscaled: i128, scale: i32) -> Self {
        Self { scale, unscaled }
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scale <= 0 {
            return write!(f, "{}e{}", self.unscaled, -self.scale);
        }
        let scale = self.scale as u32;
        let divisor = 10i128.pow(scale);
        let whole = self.unscaled / divisor;
        let frac = (self.unscaled % divisor).unsigned_abs();
        write!(f, "{whole}.{frac:0width$}", width = scale as usize)
    }
}

/// A typed value held in an entry's data map. Mirrors the on-wire tagged
/// union: string, signed 64-bit integer, 64-bit float, boolean, decimal, or
/// null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    String(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Decimal(Decimal),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A row's data: column name to typed value, in insertion order preserved by
/// a `BTreeMap` for stable iteration (needed by the checkpoint store's
/// canonical serialisation).
pub type DataMap = BTreeMap<String, Value>;

/// The mutation kind an entry performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl Operation {
    pub fn tag(&self) -> u8 {
        match self {
            Operation::Insert => 0,
            Operation::Update => 1,
            Operation::Delete => 2,
            Operation::Upsert => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Operation::Insert),
            1 => Some(Operation::Update),
            2 => Some(Operation::Delete),
            3 => Some(Operation::Upsert),
            _ => None,
        }
    }
}

/// A single row mutation. Immutable once handed to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub db_name: String,
    pub table_name: String,
    pub operation: Operation,
    pub data: DataMap,
}

impl Entry {
    /// Looks up the primary-key value by column name, as declared by the
    /// statement catalog for this entry's table.
    pub fn primary_key_value<'a>(&'a self, pk_column: &str) -> Option<&'a Value> {
        self.data.get(pk_column)
    }
}

/// An atomic unit submitted by a client: one or more entries sharing a
/// transaction id and fate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub transaction_id: String,
    pub timestamp: i64,
    pub entries: Vec<Entry>,
}

/// `(db_name, table_name, primary_key)`, the cache's key shape. The primary
/// key is stored as its canonical string form so heterogeneous key types
/// (integer or string primary keys) share one map.
pub type CacheKey = (String, String, String);

/// Renders a primary-key `Value` into the canonical string form used as the
/// third element of a `CacheKey`.
pub fn canonical_key(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::I64(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Decimal(d) => d.to_string(),
    }
}

/// Status of a [`CheckpointRecord`]. Only `Completed` rows are consulted
/// during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
}

/// A periodic "cache-consistent-through" marker persisted in the relational
/// store and used as a recovery anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: i64,
    pub cache_name: String,
    pub checkpoint_time: i64,
    pub last_transaction_id: String,
    pub wal_index: u64,
    pub entry_count: u64,
    pub body_checksum: String,
    pub status: CheckpointStatus,
}

/// What kind of data-loss event the recovery engine recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataLossKind {
    SingleSkip,
    ForwardSearchSkip,
    CheckpointJump,
    Rebuild,
    EmergencyCheckpoint,
}

/// A row written to `chronicle_data_loss` for post-mortem review whenever
/// the recovery engine skips or rebuilds past corruption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLossRecord {
    pub loss_type: DataLossKind,
    pub start_index: u64,
    pub estimated_loss: u64,
    pub recovery_action: String,
    pub ts: i64,
}

/// A row written to `delta_log` alongside a batch's row mutations, when the
/// caller opts in. Records the account-level effect of one entry so a
/// downstream audit can reconcile the relational store against the WAL
/// without replaying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub consumer_name: String,
    pub processed_at: i64,
    pub offset: u64,
    pub db_name: String,
    pub account_id: String,
    pub amount: Decimal,
}
