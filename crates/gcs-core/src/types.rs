//! Record types stored in the GCS tables.
//!
//! These are the logical records exchanged with the store. All types are
//! serializable to/from JSON, the reference wire encoding (see
//! [`crate::codec`]).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::id::ClientId;

// ── Object table ───────────────────────────────────────────────────

/// Locations of an object: the managers holding a copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectTableData {
    pub managers: Vec<String>,
}

// ── Heartbeat table ────────────────────────────────────────────────

/// Periodic resource report of a cluster member.
///
/// Labels and capacities are parallel lists; a label appears at most once
/// in each list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatTableData {
    /// Hex projection of the reporting client's identifier.
    pub client_id: String,
    pub resources_available_label: Vec<String>,
    pub resources_available_capacity: Vec<f64>,
    pub resources_total_label: Vec<String>,
    pub resources_total_capacity: Vec<f64>,
}

/// Returned when a heartbeat would carry the same resource label twice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate resource label: {0}")]
pub struct DuplicateLabel(pub String);

impl HeartbeatTableData {
    /// Build a heartbeat from ordered `(label, available, total)` triples.
    pub fn from_resources<'a>(
        client_id: ClientId,
        resources: impl IntoIterator<Item = (&'a str, f64, f64)>,
    ) -> Result<Self, DuplicateLabel> {
        let mut data = HeartbeatTableData {
            client_id: client_id.hex(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for (label, available, total) in resources {
            if !seen.insert(label) {
                return Err(DuplicateLabel(label.to_string()));
            }
            data.resources_available_label.push(label.to_string());
            data.resources_available_capacity.push(available);
            data.resources_total_label.push(label.to_string());
            data.resources_total_capacity.push(total);
        }
        Ok(data)
    }

    /// Check that no label repeats within either list. Records built with
    /// [`Self::from_resources`] always pass; hand-built ones may not.
    pub fn check_labels(&self) -> Result<(), DuplicateLabel> {
        for labels in [&self.resources_available_label, &self.resources_total_label] {
            let mut seen = HashSet::new();
            if let Some(label) = labels.iter().find(|label| !seen.insert(label.as_str())) {
                return Err(DuplicateLabel(label.clone()));
            }
        }
        Ok(())
    }

    /// Available capacity keyed by label.
    pub fn available(&self) -> BTreeMap<&str, f64> {
        zip_labels(&self.resources_available_label, &self.resources_available_capacity)
    }

    /// Total capacity keyed by label.
    pub fn total(&self) -> BTreeMap<&str, f64> {
        zip_labels(&self.resources_total_label, &self.resources_total_capacity)
    }
}

fn zip_labels<'a>(labels: &'a [String], values: &[f64]) -> BTreeMap<&'a str, f64> {
    labels
        .iter()
        .map(String::as_str)
        .zip(values.iter().copied())
        .collect()
}

// ── Task table ─────────────────────────────────────────────────────

/// Scheduling state of a task, as a set of bit flags.
///
/// A stored task is in exactly one state, but test-and-update predicates
/// use unions of states as an "any of these" mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchedulingState(u32);

impl SchedulingState {
    pub const WAITING: Self = Self(1);
    pub const SCHEDULED: Self = Self(1 << 1);
    pub const QUEUED: Self = Self(1 << 2);
    pub const RUNNING: Self = Self(1 << 3);
    pub const DONE: Self = Self(1 << 4);
    pub const LOST: Self = Self(1 << 5);
    pub const RECONSTRUCTING: Self = Self(1 << 6);

    const NAMED: [(Self, &'static str); 7] = [
        (Self::WAITING, "WAITING"),
        (Self::SCHEDULED, "SCHEDULED"),
        (Self::QUEUED, "QUEUED"),
        (Self::RUNNING, "RUNNING"),
        (Self::DONE, "DONE"),
        (Self::LOST, "LOST"),
        (Self::RECONSTRUCTING, "RECONSTRUCTING"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every flag of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` and `other` share at least one flag.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for SchedulingState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SchedulingState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SchedulingState {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for SchedulingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("SchedulingState(empty)");
        }
        let mut rest = self.0;
        let mut names = Vec::new();
        for (flag, name) in Self::NAMED {
            if self.contains(flag) {
                names.push(name.to_string());
                rest &= !flag.0;
            }
        }
        if rest != 0 {
            names.push(format!("{rest:#x}"));
        }
        write!(f, "SchedulingState({})", names.join(" | "))
    }
}

/// Scheduling record of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTableData {
    pub scheduling_state: SchedulingState,
    /// Scheduler that currently owns the task.
    pub scheduler_id: ClientId,
}

/// Predicate and new state for an atomic task-table update.
///
/// The update applies when the stored scheduler equals `test_scheduler_id`
/// and the stored state intersects `test_state_bitmask`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTableTestAndUpdate {
    pub test_scheduler_id: ClientId,
    pub test_state_bitmask: SchedulingState,
    pub update_state: SchedulingState,
}

impl TaskTableTestAndUpdate {
    /// Evaluate the predicate against a stored record.
    pub fn matches(&self, current: &TaskTableData) -> bool {
        current.scheduler_id == self.test_scheduler_id
            && current.scheduling_state.intersects(self.test_state_bitmask)
    }
}

// ── Client table ───────────────────────────────────────────────────

/// Membership record of a cluster member.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientTableData {
    pub client_id: ClientId,
    /// `true` when the member joined, `false` when it left.
    pub is_insertion: bool,
    pub node_manager_address: String,
    pub node_manager_port: u16,
    pub object_manager_port: u16,
}
