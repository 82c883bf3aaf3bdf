//! Wire protocol between GCS clients and the store server.
//!
//! Frames are single-line JSON documents terminated by `\n`. A client sends
//! [`Request`]s tagged with a connection-local id; the server answers each
//! with exactly one [`ServerFrame::Reply`] carrying the same id, in request
//! order. Pub/sub deliveries arrive as [`ServerFrame::Message`] on the same
//! connection, interleaved with replies.
//!
//! ```text
//! client → server   {"id":7,"command":{"op":"get","key":"OBJECT:..."}}
//! server → client   {"type":"reply","id":7,"outcome":{"status":"value","value":[...]}}
//! server → client   {"type":"message","channel":"OBJECT:...","tag":"...","value":[...]}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Connection-local request identifier.
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub command: Command,
}

/// Announce a write on `channel`; subscribers receive `tag` (the written
/// key's identifier) alongside the new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub channel: String,
    pub tag: String,
}

/// Predicate over a top-level field of a JSON record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// The field equals `value`.
    Equals { field: String, value: serde_json::Value },
    /// The field is an unsigned integer sharing at least one bit with `mask`.
    BitsAny { field: String, mask: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Store `value` under `key`, then optionally publish it.
    Set {
        key: String,
        value: Vec<u8>,
        publish: Option<Publish>,
    },
    /// Read the latest value under `key`.
    Get { key: String },
    /// Read every entry whose key starts with `prefix`, in key order.
    Scan { prefix: String },
    /// Atomically: read `key`, and if every condition holds, overwrite the
    /// listed fields, store the result and optionally publish it.
    UpdateIf {
        key: String,
        conditions: Vec<Condition>,
        assign: BTreeMap<String, serde_json::Value>,
        publish: Option<Publish>,
    },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

impl Command {
    /// Short name used in logs and error reports.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Get { .. } => "get",
            Command::Scan { .. } => "scan",
            Command::UpdateIf { .. } => "update_if",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Value { value: Option<Vec<u8>> },
    Entries { entries: Vec<Entry> },
    /// Result of an `UpdateIf`: the stored record after the call (absent if
    /// the key does not exist) and whether the assignment happened.
    Updated { value: Option<Vec<u8>>, applied: bool },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Pong,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply { id: RequestId, outcome: Outcome },
    Message {
        channel: String,
        tag: String,
        value: Vec<u8>,
    },
}

/// Serialize a frame as one newline-terminated line.
pub fn encode_line<T: Serialize>(frame: &T) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line (with or without its trailing newline).
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a [u8]) -> serde_json::Result<T> {
    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    serde_json::from_slice(trimmed)
}
