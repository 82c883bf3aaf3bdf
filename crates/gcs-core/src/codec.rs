//! Record codec boundary and store key layout.
//!
//! Every table kind owns a [`TablePrefix`]. Records live in the store under
//! `{PREFIX}:{scope}:{key}` and writes are announced on the channel
//! `{PREFIX}:{scope}`, so one subscription covers every key of a scope.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::id::Id;
use crate::types::*;

/// Errors raised while encoding or decoding a record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {table} record: {reason}")]
    Encode { table: TablePrefix, reason: String },

    #[error("failed to decode {table} record: {reason}")]
    Decode { table: TablePrefix, reason: String },

    #[error("invalid {table} record: {reason}")]
    Invalid { table: TablePrefix, reason: String },
}

/// Table kinds, each with its own key namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TablePrefix {
    Object,
    Heartbeat,
    Task,
    Client,
}

impl TablePrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            TablePrefix::Object => "OBJECT",
            TablePrefix::Heartbeat => "HEARTBEAT",
            TablePrefix::Task => "TASK",
            TablePrefix::Client => "CLIENT",
        }
    }

    /// Store key of the record for `key` under `scope`.
    pub fn key<S: Id, K: Id>(self, scope: &S, key: &K) -> String {
        format!("{}:{}:{}", self.as_str(), scope.hex(), key.hex())
    }

    /// Notification channel (and scan prefix root) for every key under `scope`.
    pub fn channel<S: Id>(self, scope: &S) -> String {
        format!("{}:{}", self.as_str(), scope.hex())
    }
}

impl fmt::Display for TablePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed record stored in one table kind.
///
/// The default codec is JSON; a table may override both directions.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    const TABLE: TablePrefix;

    /// Table-specific invariants checked before a write.
    fn validate(&self) -> Result<(), CodecError> {
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Encode {
            table: Self::TABLE,
            reason: e.to_string(),
        })
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            table: Self::TABLE,
            reason: e.to_string(),
        })
    }
}

impl Record for ObjectTableData {
    const TABLE: TablePrefix = TablePrefix::Object;
}

impl Record for HeartbeatTableData {
    const TABLE: TablePrefix = TablePrefix::Heartbeat;

    fn validate(&self) -> Result<(), CodecError> {
        self.check_labels().map_err(|e| CodecError::Invalid {
            table: Self::TABLE,
            reason: e.to_string(),
        })
    }
}

impl Record for TaskTableData {
    const TABLE: TablePrefix = TablePrefix::Task;
}

impl Record for ClientTableData {
    const TABLE: TablePrefix = TablePrefix::Client;
}
