//! StoreEngine: redb-backed keyspace of the GCS backing store.
//!
//! Provides last-write-wins `set`, `get`, ordered prefix scans, and an
//! atomic conditional read-modify-write over JSON records. The engine
//! supports both on-disk and in-memory backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::protocol::Condition;
use crate::tables::ENTRIES;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Result of [`StoreEngine::update_if`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The record as stored after the call; `None` if the key is absent.
    pub value: Option<Vec<u8>>,
    pub applied: bool,
}

/// Thread-safe keyspace backed by redb.
#[derive(Clone)]
pub struct StoreEngine {
    db: Arc<Database>,
}

impl StoreEngine {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let engine = Self { db: Arc::new(db) };
        engine.ensure_tables()?;
        debug!(?path, "store opened");
        Ok(engine)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let engine = Self { db: Arc::new(db) };
        engine.ensure_tables()?;
        debug!("in-memory store opened");
        Ok(engine)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or overwrite the value under `key`.
    pub fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, bytes = value.len(), "entry stored");
        Ok(())
    }

    /// Latest value under `key`.
    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Every entry whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(results)
    }

    /// Atomically test a JSON record against `conditions` and, if all hold,
    /// overwrite the fields in `assign`.
    ///
    /// The read and the write share one write transaction, so no other
    /// writer can interleave.
    pub fn update_if(
        &self,
        key: &str,
        conditions: &[Condition],
        assign: &BTreeMap<String, serde_json::Value>,
    ) -> StoreResult<UpdateOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(current) = current else {
                return Ok(UpdateOutcome {
                    value: None,
                    applied: false,
                });
            };

            let mut record: serde_json::Value =
                serde_json::from_slice(&current).map_err(|e| update_err(key, e))?;
            let Some(fields) = record.as_object_mut() else {
                return Err(update_err(key, "record is not a JSON object"));
            };

            if conditions.iter().all(|c| holds(c, fields)) {
                for (field, value) in assign {
                    fields.insert(field.clone(), value.clone());
                }
                let updated = serde_json::to_vec(&record).map_err(|e| update_err(key, e))?;
                table
                    .insert(key, updated.as_slice())
                    .map_err(map_err!(Write))?;
                UpdateOutcome {
                    value: Some(updated),
                    applied: true,
                }
            } else {
                UpdateOutcome {
                    value: Some(current),
                    applied: false,
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, applied = outcome.applied, "conditional update");
        Ok(outcome)
    }
}

fn update_err(key: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Update {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn holds(condition: &Condition, fields: &serde_json::Map<String, serde_json::Value>) -> bool {
    match condition {
        Condition::Equals { field, value } => fields.get(field) == Some(value),
        Condition::BitsAny { field, mask } => fields
            .get(field)
            .and_then(serde_json::Value::as_u64)
            .is_some_and(|bits| bits & mask != 0),
    }
}
