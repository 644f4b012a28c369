//! The pre-built statement catalog the applier binds against.
//!
//! The source discovers columns and primary keys through runtime reflection
//! on annotated classes; here that becomes a startup-built map from table
//! name to its declared columns, primary key, and ready-to-bind SQL
//! statements, loaded from a small declarative TOML file rather than built
//! by reflection.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::types::Operation;

/// One table's declared shape and the statements the applier runs against
/// it. Parameters are bound in `columns` order; the primary key is bound
/// last for `Update` and `Delete`.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub db_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub primary_key: String,
    pub insert_stmt: String,
    pub update_stmt: String,
    pub delete_stmt: String,
}

impl CatalogEntry {
    fn build(db_name: String, table_name: String, columns: Vec<String>, primary_key: String) -> Self {
        let insert_stmt = build_upsert_stmt(&table_name, &columns);
        let update_stmt = build_update_stmt(&table_name, &columns, &primary_key);
        let delete_stmt = format!("DELETE FROM {table_name} WHERE {primary_key} = ?1");
        Self { db_name, table_name, columns, primary_key, insert_stmt, update_stmt, delete_stmt }
    }

    /// Returns the statement for a given operation. `Upsert` and `Insert`
    /// share the `INSERT OR REPLACE` form since the cache is keyed by
    /// primary key regardless of which one the caller chose.
    pub fn statement_for(&self, op: Operation) -> &str {
        match op {
            Operation::Insert | Operation::Upsert => &self.insert_stmt,
            Operation::Update => &self.update_stmt,
            Operation::Delete => &self.delete_stmt,
        }
    }

    /// The non-primary-key columns, in declared order, for an `UPDATE`'s
    /// `SET` clause.
    pub fn update_columns(&self) -> impl Iterator<Item = &String> {
        self.columns.iter().filter(move |c| *c != &self.primary_key)
    }
}

fn build_upsert_stmt(table_name: &str, columns: &[String]) -> String {
    let col_list = columns.join(", ");
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    format!("INSERT OR REPLACE INTO {table_name} ({col_list}) VALUES ({})", placeholders.join(", "))
}

fn build_update_stmt(table_name: &str, columns: &[String], primary_key: &str) -> String {
    let non_pk: Vec<&String> = columns.iter().filter(|c| c.as_str() != primary_key).collect();
    let set_clause: Vec<String> =
        non_pk.iter().enumerate().map(|(i, c)| format!("{c} = ?{}", i + 1)).collect();
    format!(
        "UPDATE {table_name} SET {} WHERE {primary_key} = ?{}",
        set_clause.join(", "),
        non_pk.len() + 1
    )
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(rename = "table")]
    tables: Vec<TableSpec>,
}

#[derive(Debug, Deserialize)]
struct TableSpec {
    db: String,
    name: String,
    columns: Vec<String>,
    pk: String,
}

/// Process-wide, RwLock-guarded map from `(db_name, table_name)` to its
/// catalog entry.
pub struct StatementCatalog {
    entries: RwLock<HashMap<(String, String), CatalogEntry>>,
}

impl StatementCatalog {
    pub fn empty() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Loads the catalog from a declarative TOML file (see [`TableSpec`]'s
    /// shape: a list of `[[table]]` entries each naming `db`, `name`,
    /// `columns`, and `pk`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(text)?;
        let mut entries = HashMap::new();
        for spec in file.tables {
            if !spec.columns.contains(&spec.pk) {
                return Err(PipelineError::Malformed {
                    reason: format!("table '{}' catalog entry is missing its primary key column '{}' from its column list", spec.name, spec.pk),
                });
            }
            let entry = CatalogEntry::build(spec.db.clone(), spec.name.clone(), spec.columns, spec.pk);
            entries.insert((spec.db, spec.name), entry);
        }
        Ok(Self { entries: RwLock::new(entries) })
    }

    pub fn get(&self, db_name: &str, table_name: &str) -> Option<CatalogEntry> {
        self.entries.read().get(&(db_name.to_string(), table_name.to_string())).cloned()
    }

    pub fn register(&self, db_name: impl Into<String>, table_name: impl Into<String>, columns: Vec<String>, primary_key: impl Into<String>) {
        let db_name = db_name.into();
        let table_name = table_name.into();
        let primary_key = primary_key.into();
        let entry = CatalogEntry::build(db_name.clone(), table_name.clone(), columns, primary_key);
        self.entries.write().insert((db_name, table_name), entry);
    }

    /// All `(db_name, table_name)` pairs the catalog knows about, used by
    /// the boot sequencer to discover which caches to eagerly populate and
    /// by recovery's rebuild-from-database fallback.
    pub fn known_tables(&self) -> Vec<(String, String)> {
        self.entries.read().keys().cloned().collect()
    }
}

impl Clone for CatalogEntry {
    fn clone(&self) -> Self {
        Self {
            db_name: self.db_name.clone(),
            table_name: self.table_name.clone(),
            columns: self.columns.clone(),
            primary_key: self.primary_key.clone(),
            insert_stmt: self.insert_stmt.clone(),
            update_stmt: self.update_stmt.clone(),
            delete_stmt: self.delete_stmt.clone(),
        }
    }
}
