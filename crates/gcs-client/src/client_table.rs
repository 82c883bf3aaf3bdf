//! ClientTable: cluster membership.
//!
//! Each process registers itself under a local client id and observes
//! every member's insertion and removal through one subscription to the
//! membership scope. A local cache holds the latest record per member.
//!
//! # Lifecycle
//!
//! ```text
//! Unregistered ──connect()──▶ Connected ──disconnect()──▶ Disconnected
//! ```
//!
//! `connect` pipelines three requests on the connection: the subscription,
//! a full read of the table, and the local insertion record. The store
//! answers them in order, so the full read seeds the cache with members
//! that joined earlier and the local insertion is always observed after
//! the subscription is live.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gcs_core::{ClientId, ClientTableData, JobId};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{GcsError, GcsResult};
use crate::table::Table;

/// Membership records share one scope.
const MEMBERSHIP_SCOPE: JobId = JobId::nil();

/// Receives a membership event: the member's id and its latest record.
pub type ClientCallback = Arc<dyn Fn(ClientId, &ClientTableData) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    Unregistered,
    Connected,
    Disconnected,
}

struct Membership {
    local_client_id: ClientId,
    local_client: Option<ClientTableData>,
    state: MembershipState,
    cache: HashMap<ClientId, ClientTableData>,
    added: Vec<ClientCallback>,
    removed: Vec<ClientCallback>,
}

impl Membership {
    /// Fold one observed record into the cache and return the callbacks it
    /// triggers. Only changes to the view fire: a new member, or a known
    /// member going from inserted to removed.
    fn observe(&mut self, id: ClientId, data: &ClientTableData) -> Vec<ClientCallback> {
        let previous = self.cache.get(&id).map(|known| known.is_insertion);
        match (previous, data.is_insertion) {
            (None, true) => {
                self.cache.insert(id, data.clone());
                self.added.clone()
            }
            (None, false) | (Some(true), false) => {
                self.cache.insert(id, data.clone());
                self.removed.clone()
            }
            (Some(true), true) => {
                debug!(client_id = %id, "duplicate insertion");
                self.cache.insert(id, data.clone());
                Vec::new()
            }
            (Some(false), true) => {
                warn!(client_id = %id, "insertion for a removed client ignored");
                Vec::new()
            }
            (Some(false), false) => Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ClientTable {
    table: Table<ClientId, ClientTableData>,
    membership: Arc<Mutex<Membership>>,
}

impl ClientTable {
    pub fn new(connection: Connection, local_client_id: ClientId) -> Self {
        Self {
            table: Table::new(connection),
            membership: Arc::new(Mutex::new(Membership {
                local_client_id,
                local_client: None,
                state: MembershipState::Unregistered,
                cache: HashMap::new(),
                added: Vec::new(),
                removed: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Membership> {
        lock(&self.membership)
    }

    /// Register this process as a member.
    ///
    /// `local.client_id` must equal [`Self::local_client_id`]; the record
    /// is written with `is_insertion = true` whatever the caller passed.
    pub fn connect(&self, local: ClientTableData) -> GcsResult<()> {
        let mut local = local;
        {
            let membership = self.lock();
            if membership.state != MembershipState::Unregistered {
                return Err(GcsError::ClientAlreadyConnected);
            }
            if local.client_id != membership.local_client_id {
                return Err(GcsError::LocalClientMismatch {
                    expected: membership.local_client_id,
                    got: local.client_id,
                });
            }
        }
        local.is_insertion = true;
        let local_id = local.client_id;

        let on_notification = {
            let membership = Arc::clone(&self.membership);
            move |id: ClientId, data: ClientTableData| notify(&membership, id, &data)
        };
        self.table.subscribe(
            &MEMBERSHIP_SCOPE,
            &ClientId::nil(),
            on_notification,
            move || debug!(client_id = %local_id, "membership subscription live"),
        )?;

        let membership = Arc::clone(&self.membership);
        self.table.lookup_all(&MEMBERSHIP_SCOPE, move |records| {
            debug!(members = records.len(), "membership snapshot read");
            for (id, data) in records {
                notify(&membership, id, &data);
            }
        })?;

        self.table.add(&MEMBERSHIP_SCOPE, &local_id, local.clone(), |id, _| {
            info!(client_id = %id, "local client registered");
        })?;

        let mut membership = self.lock();
        membership.local_client = Some(local);
        membership.state = MembershipState::Connected;
        Ok(())
    }

    /// Announce that this process left. Reconnecting afterwards is not
    /// supported.
    pub fn disconnect(&self) -> GcsResult<()> {
        let removal = {
            let membership = self.lock();
            if membership.state != MembershipState::Connected {
                return Err(GcsError::ClientNotConnected);
            }
            let mut removal = membership.local_client.clone().unwrap_or_default();
            removal.client_id = membership.local_client_id;
            removal.is_insertion = false;
            removal
        };

        let local_id = removal.client_id;
        self.table.add(&MEMBERSHIP_SCOPE, &local_id, removal, |id, _| {
            info!(client_id = %id, "local client deregistered");
        })?;
        self.lock().state = MembershipState::Disconnected;
        Ok(())
    }

    /// Called, in registration order, for every member that joins.
    pub fn register_client_added_callback(
        &self,
        callback: impl Fn(ClientId, &ClientTableData) + Send + Sync + 'static,
    ) {
        self.lock().added.push(Arc::new(callback));
    }

    /// Called, in registration order, for every member that leaves.
    pub fn register_client_removed_callback(
        &self,
        callback: impl Fn(ClientId, &ClientTableData) + Send + Sync + 'static,
    ) {
        self.lock().removed.push(Arc::new(callback));
    }

    pub fn local_client_id(&self) -> ClientId {
        self.lock().local_client_id
    }

    /// The record this process registered with. Before `connect` this is
    /// a template carrying the local id, ready to be filled in and passed
    /// to `connect`.
    pub fn local_client(&self) -> ClientTableData {
        let membership = self.lock();
        membership
            .local_client
            .clone()
            .unwrap_or_else(|| ClientTableData {
                client_id: membership.local_client_id,
                is_insertion: true,
                ..Default::default()
            })
    }

    /// Latest cached record for `id`, or a record with a nil id if this
    /// process has not observed the member. Not a linearizable read.
    pub fn get_client(&self, id: &ClientId) -> ClientTableData {
        self.lock().cache.get(id).cloned().unwrap_or_default()
    }

    /// Snapshot of every member observed so far.
    pub fn clients(&self) -> BTreeMap<ClientId, ClientTableData> {
        self.lock()
            .cache
            .iter()
            .map(|(id, data)| (*id, data.clone()))
            .collect()
    }

    pub fn state(&self) -> MembershipState {
        self.lock().state
    }

    pub(crate) fn clear_cache(&self) {
        self.lock().cache.clear();
    }
}

fn lock(membership: &Mutex<Membership>) -> MutexGuard<'_, Membership> {
    membership.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply one record and run the callbacks it triggers outside the lock.
fn notify(membership: &Mutex<Membership>, id: ClientId, data: &ClientTableData) {
    let callbacks = lock(membership).observe(id, data);
    for callback in callbacks {
        callback(id, data);
    }
}
