//! gcs-store: embedded backing store for the GCS.
//!
//! Backed by [redb](https://docs.rs/redb), provides the single-keyspace
//! store the GCS client talks to: last-write-wins records, ordered prefix
//! scans, an atomic conditional update, and publish/subscribe channels,
//! served over a newline-framed JSON protocol.
//!
//! # Architecture
//!
//! ```text
//! StoreServer (tokio, one task per connection)
//!   ├── StoreEngine  redb keyspace (on-disk or in-memory)
//!   ├── Broker       channel → subscriber outboxes
//!   └── protocol     Request / ServerFrame line codec
//! ```

pub mod broker;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tables;

pub use broker::Broker;
pub use engine::{StoreEngine, UpdateOutcome};
pub use error::{StoreError, StoreResult};
pub use server::{spawn_background, ServerHandle, StoreServer};
