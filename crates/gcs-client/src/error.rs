//! Error types for the GCS client.

use std::fmt;
use std::sync::Arc;

use gcs_core::{ClientId, CodecError, IdError, TablePrefix};
use thiserror::Error;

/// Result type alias for client operations.
pub type GcsResult<T> = Result<T, GcsError>;

/// Errors returned synchronously by client operations.
///
/// Outcomes of submitted operations are never reported here; they arrive
/// through callbacks, and faults after submission go to the fatal handler.
#[derive(Debug, Error)]
pub enum GcsError {
    #[error("failed to connect to store at {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("client is already connected")]
    AlreadyConnected,

    #[error("client is not connected to a store")]
    NotConnected,

    #[error("an event loop is already attached")]
    AlreadyAttached,

    #[error("local client is not connected to the client table")]
    ClientNotConnected,

    #[error("local client already connected to the client table")]
    ClientAlreadyConnected,

    #[error("record for client {got} does not match local client {expected}")]
    LocalClientMismatch { expected: ClientId, got: ClientId },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which operation a request belongs to, for fault reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    pub op: &'static str,
    pub table: Option<TablePrefix>,
    pub scope: Option<String>,
    pub key: Option<String>,
}

impl OpContext {
    pub fn new(op: &'static str) -> Self {
        Self {
            op,
            table: None,
            scope: None,
            key: None,
        }
    }

    pub fn table(mut self, table: TablePrefix) -> Self {
        self.table = Some(table);
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op)?;
        if let Some(table) = self.table {
            write!(f, " table={table}")?;
        }
        if let Some(scope) = &self.scope {
            write!(f, " scope={scope}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " key={key}")?;
        }
        Ok(())
    }
}

/// A fault after which the connection can no longer keep its ordering
/// guarantees: store error replies, undecodable frames, connection loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal {
    pub context: OpContext,
    pub reason: String,
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal GCS fault during {}: {}", self.context, self.reason)
    }
}

/// Receives the first fatal fault of a connection.
pub type FatalHandler = Arc<dyn Fn(&Fatal) + Send + Sync>;

/// Default handler: a broken connection must not be used further.
pub(crate) fn panic_on_fatal(fatal: &Fatal) {
    panic!("{fatal}");
}
