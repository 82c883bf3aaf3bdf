//! gcs-core: shared vocabulary of the GCS client and store.
//!
//! Identifiers, the logical records of each table, the record codec
//! boundary, and `gcs.toml` parsing.

pub mod codec;
pub mod config;
pub mod id;
pub mod types;

pub use codec::{CodecError, Record, TablePrefix};
pub use config::{EventLoopKind, GcsConfig};
pub use id::*;
pub use types::*;
