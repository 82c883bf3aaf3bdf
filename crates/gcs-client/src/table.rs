//! Table: typed asynchronous operations over one record kind.
//!
//! A `Table<K, D>` addresses records of type `D` by `(scope, key)` and
//! turns each operation into one store command whose outcome is decoded
//! and handed to the caller's callback on an event-loop turn. Nothing is
//! returned synchronously except precondition failures.
//!
//! Every write is published on the scope's channel with the key's hex id
//! as tag, which is what `subscribe` filters on.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use gcs_core::{
    ClientId, HeartbeatTableData, Id, JobId, ObjectId, ObjectTableData, Record, TaskId,
    TaskTableData, TaskTableTestAndUpdate,
};
use gcs_store::protocol::{Command, Condition, Outcome, Publish};
use serde_json::json;
use tracing::debug;

use crate::connection::{Connection, MessageHandler};
use crate::error::{GcsResult, OpContext};

pub type ObjectTable = Table<ObjectId, ObjectTableData>;
pub type HeartbeatTable = Table<ClientId, HeartbeatTableData>;
pub type TaskTable = Table<TaskId, TaskTableData>;

pub struct Table<K: Id, D: Record> {
    connection: Connection,
    _marker: PhantomData<fn() -> (K, D)>,
}

impl<K: Id, D: Record> Clone for Table<K, D> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: Id, D: Record> Table<K, D> {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            _marker: PhantomData,
        }
    }

    fn context(op: &'static str, scope: &JobId, key: Option<&K>) -> OpContext {
        let context = OpContext::new(op).table(D::TABLE).scope(scope.hex());
        match key {
            Some(key) => context.key(key.hex()),
            None => context,
        }
    }

    /// Write `data` under `(scope, key)`, last write wins.
    ///
    /// `on_done` receives the key and the written record once the store
    /// has acknowledged the write.
    pub fn add(
        &self,
        scope: &JobId,
        key: &K,
        data: D,
        on_done: impl FnOnce(K, D) + Send + 'static,
    ) -> GcsResult<()> {
        data.validate()?;
        let command = Command::Set {
            key: D::TABLE.key(scope, key),
            value: data.encode()?,
            publish: Some(Publish {
                channel: D::TABLE.channel(scope),
                tag: key.hex(),
            }),
        };
        let key = *key;
        self.connection.request(
            command,
            Self::context("add", scope, Some(&key)),
            Box::new(move |outcome: Outcome| match outcome {
                Outcome::Ok => {
                    on_done(key, data);
                    Ok(())
                }
                other => Err(unexpected("add", &other)),
            }),
        )?;
        Ok(())
    }

    /// Read the latest record under `(scope, key)`. Exactly one of the
    /// callbacks fires.
    pub fn lookup(
        &self,
        scope: &JobId,
        key: &K,
        on_found: impl FnOnce(K, D) + Send + 'static,
        on_not_found: impl FnOnce(K) + Send + 'static,
    ) -> GcsResult<()> {
        let command = Command::Get {
            key: D::TABLE.key(scope, key),
        };
        let key = *key;
        self.connection.request(
            command,
            Self::context("lookup", scope, Some(&key)),
            Box::new(move |outcome: Outcome| match outcome {
                Outcome::Value { value: Some(bytes) } => {
                    let data = D::decode(&bytes).map_err(|e| e.to_string())?;
                    on_found(key, data);
                    Ok(())
                }
                Outcome::Value { value: None } => {
                    on_not_found(key);
                    Ok(())
                }
                other => Err(unexpected("lookup", &other)),
            }),
        )?;
        Ok(())
    }

    /// Read every record under `scope`, in key order.
    pub fn lookup_all(
        &self,
        scope: &JobId,
        on_done: impl FnOnce(Vec<(K, D)>) + Send + 'static,
    ) -> GcsResult<()> {
        let command = Command::Scan {
            prefix: format!("{}:", D::TABLE.channel(scope)),
        };
        self.connection.request(
            command,
            Self::context("lookup_all", scope, None),
            Box::new(move |outcome: Outcome| match outcome {
                Outcome::Entries { entries } => {
                    let mut records = Vec::with_capacity(entries.len());
                    for entry in entries {
                        let tag = entry.key.rsplit(':').next().unwrap_or_default();
                        let key = K::from_hex(tag).map_err(|e| e.to_string())?;
                        let data = D::decode(&entry.value).map_err(|e| e.to_string())?;
                        records.push((key, data));
                    }
                    on_done(records);
                    Ok(())
                }
                other => Err(unexpected("lookup_all", &other)),
            }),
        )?;
        Ok(())
    }

    /// Receive every later write under `scope`, or only writes to
    /// `key_filter` unless it is nil.
    ///
    /// `on_subscribed` fires once the store confirms the subscription and
    /// before any notification, including those for this client's own
    /// writes submitted after this call.
    pub fn subscribe(
        &self,
        scope: &JobId,
        key_filter: &K,
        on_notification: impl Fn(K, D) + Send + Sync + 'static,
        on_subscribed: impl FnOnce() + Send + 'static,
    ) -> GcsResult<()> {
        let filter = *key_filter;
        let on_message: MessageHandler = Arc::new(move |tag: &str, value: &[u8]| {
            let key = K::from_hex(tag).map_err(|e| e.to_string())?;
            if !filter.is_nil() && key != filter {
                return Ok(());
            }
            let data = D::decode(value).map_err(|e| e.to_string())?;
            on_notification(key, data);
            Ok(())
        });

        let context = if filter.is_nil() {
            Self::context("subscribe", scope, None)
        } else {
            Self::context("subscribe", scope, Some(&filter))
        };
        self.connection.subscribe(
            &D::TABLE.channel(scope),
            context,
            on_message,
            Box::new(on_subscribed),
        )?;
        Ok(())
    }

    /// Stop every subscription of this table kind under `scope`.
    pub fn unsubscribe(&self, scope: &JobId) -> GcsResult<()> {
        self.connection
            .unsubscribe(&D::TABLE.channel(scope), Self::context("unsubscribe", scope, None))?;
        Ok(())
    }
}

/// Records that support an atomic conditional update in the store.
pub trait TestAndUpdateRecord: Record {
    type Update: Send + 'static;

    /// Predicates the stored record must satisfy.
    fn conditions(update: &Self::Update) -> Vec<Condition>;

    /// Fields written when every predicate holds.
    fn assignments(update: &Self::Update) -> BTreeMap<String, serde_json::Value>;
}

impl TestAndUpdateRecord for TaskTableData {
    type Update = TaskTableTestAndUpdate;

    fn conditions(update: &TaskTableTestAndUpdate) -> Vec<Condition> {
        vec![
            Condition::Equals {
                field: "scheduler_id".to_string(),
                value: json!(update.test_scheduler_id.hex()),
            },
            Condition::BitsAny {
                field: "scheduling_state".to_string(),
                mask: u64::from(update.test_state_bitmask.bits()),
            },
        ]
    }

    fn assignments(update: &TaskTableTestAndUpdate) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([(
            "scheduling_state".to_string(),
            json!(update.update_state.bits()),
        )])
    }
}

impl<K: Id, D: TestAndUpdateRecord> Table<K, D> {
    /// Atomically apply `update` to the record under `(scope, key)`.
    ///
    /// `on_done` receives the record as stored after the call (`None` if
    /// the key does not exist) and whether the update was applied. Applied
    /// updates are published like any other write.
    pub fn test_and_update(
        &self,
        scope: &JobId,
        key: &K,
        update: D::Update,
        on_done: impl FnOnce(K, Option<D>, bool) + Send + 'static,
    ) -> GcsResult<()> {
        let command = Command::UpdateIf {
            key: D::TABLE.key(scope, key),
            conditions: D::conditions(&update),
            assign: D::assignments(&update),
            publish: Some(Publish {
                channel: D::TABLE.channel(scope),
                tag: key.hex(),
            }),
        };
        let key = *key;
        self.connection.request(
            command,
            Self::context("test_and_update", scope, Some(&key)),
            Box::new(move |outcome: Outcome| match outcome {
                Outcome::Updated { value, applied } => {
                    let data = value
                        .map(|bytes| D::decode(&bytes))
                        .transpose()
                        .map_err(|e| e.to_string())?;
                    debug!(%key, applied, "test_and_update finished");
                    on_done(key, data, applied);
                    Ok(())
                }
                other => Err(unexpected("test_and_update", &other)),
            }),
        )?;
        Ok(())
    }
}

fn unexpected(op: &str, outcome: &Outcome) -> String {
    format!("unexpected reply to {op}: {outcome:?}")
}
