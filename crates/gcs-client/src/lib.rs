//! gcs-client: asynchronous access to the Global Control Store.
//!
//! Typed, callback-based tables over a single connection to the backing
//! store, driven by a caller-supplied event loop. Results never come back
//! by return value; every reply and notification is delivered as a task on
//! the attached loop.
//!
//! # Architecture
//!
//! ```text
//! AsyncGcsClient
//!   ├── ObjectTable / HeartbeatTable / TaskTable   (Table<K, D>)
//!   ├── ClientTable                                (membership view)
//!   └── Connection ──▶ gcs-store server
//!          └── EventLoop (MiniLoop | TokioLoop)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use gcs_client::{new_event_loop, AsyncGcsClient};
//! use gcs_core::{EventLoopKind, JobId, ObjectId, ObjectTableData};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AsyncGcsClient::new();
//! client.connect("127.0.0.1", 6379)?;
//! let event_loop = new_event_loop(EventLoopKind::Mini)?;
//! client.attach(event_loop.clone())?;
//!
//! let data = ObjectTableData { managers: vec!["A".into()] };
//! let stop = event_loop.clone();
//! client.object_table().add(&JobId::from_random(), &ObjectId::from_random(), data, move |_, _| {
//!     stop.stop();
//! })?;
//! event_loop.run();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod client_table;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod table;

pub use client::AsyncGcsClient;
pub use client_table::{ClientCallback, ClientTable, MembershipState};
pub use connection::Connection;
pub use error::{Fatal, FatalHandler, GcsError, GcsResult, OpContext};
pub use event_loop::{new_event_loop, EventLoop, LoopTask, MiniLoop, TimerId, TokioLoop};
pub use table::{HeartbeatTable, ObjectTable, Table, TaskTable, TestAndUpdateRecord};
