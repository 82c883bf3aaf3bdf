//! AsyncGcsClient: facade over one connection and its tables.

use std::sync::Arc;

use gcs_core::{ClientId, GcsConfig};
use tracing::info;

use crate::client_table::ClientTable;
use crate::connection::Connection;
use crate::error::{FatalHandler, GcsResult};
use crate::event_loop::EventLoop;
use crate::table::{HeartbeatTable, ObjectTable, TaskTable};

/// Owns the connection to the store and exposes one typed accessor per
/// table kind. All tables share the connection.
///
/// Drop the client before the event loop it is attached to.
pub struct AsyncGcsClient {
    config: GcsConfig,
    connection: Connection,
    object_table: ObjectTable,
    heartbeat_table: HeartbeatTable,
    task_table: TaskTable,
    client_table: ClientTable,
}

impl Default for AsyncGcsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncGcsClient {
    /// A client with a random local client id and default configuration.
    pub fn new() -> Self {
        Self::with_client_id(ClientId::from_random())
    }

    /// A client that will register under `client_id` in the client table.
    pub fn with_client_id(client_id: ClientId) -> Self {
        Self::build(client_id, GcsConfig::default())
    }

    pub fn with_config(config: GcsConfig) -> Self {
        Self::build(ClientId::from_random(), config)
    }

    fn build(client_id: ClientId, config: GcsConfig) -> Self {
        let connection = Connection::new();
        Self {
            config,
            object_table: ObjectTable::new(connection.clone()),
            heartbeat_table: HeartbeatTable::new(connection.clone()),
            task_table: TaskTable::new(connection.clone()),
            client_table: ClientTable::new(connection.clone(), client_id),
            connection,
        }
    }

    /// Connect to the store at `host:port`. Can be called once.
    pub fn connect(&self, host: &str, port: u16) -> GcsResult<()> {
        self.connection
            .connect(host, port, self.config.store.connect_timeout())
    }

    /// Connect to the store named in this client's configuration.
    pub fn connect_with_config(&self) -> GcsResult<()> {
        let store = &self.config.store;
        self.connection
            .connect(&store.host, store.port, store.connect_timeout())
    }

    /// Bind all I/O and callbacks to `event_loop`. Requests submitted
    /// earlier are sent now. Can be called once.
    pub fn attach(&self, event_loop: Arc<dyn EventLoop>) -> GcsResult<()> {
        self.connection.attach(event_loop)?;
        info!(
            client_id = %self.client_table.local_client_id(),
            "GCS client attached to event loop"
        );
        Ok(())
    }

    /// Replace the default fatal handler, which panics.
    pub fn set_fatal_handler(&self, handler: FatalHandler) {
        self.connection.set_fatal_handler(handler);
    }

    pub fn object_table(&self) -> &ObjectTable {
        &self.object_table
    }

    pub fn heartbeat_table(&self) -> &HeartbeatTable {
        &self.heartbeat_table
    }

    pub fn task_table(&self) -> &TaskTable {
        &self.task_table
    }

    pub fn client_table(&self) -> &ClientTable {
        &self.client_table
    }

    pub fn config(&self) -> &GcsConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for AsyncGcsClient {
    fn drop(&mut self) {
        self.client_table.clear_cache();
        self.connection.shutdown();
    }
}
