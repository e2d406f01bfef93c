//! Lease manifest types
//!
//! A Lease is the immutable record of consumption: which GPU slots a Run
//! holds, which envelope pays for them, and when the slice started. After
//! creation the spec never changes; closure fields in status are the only
//! mutation the state layer performs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{Meta, RunReference};
use crate::Error;

/// How a leased slice is used.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LeaseRole {
    /// Computing slots paid by the run owner's own envelopes
    #[default]
    Active,
    /// Computing slots funded by a sponsor
    Borrowed,
    /// Idle slots held for fast swap on node failure
    Spare,
}

impl std::fmt::Display for LeaseRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Borrowed => write!(f, "Borrowed"),
            Self::Spare => write!(f, "Spare"),
        }
    }
}

/// The (node, GPU-slot) set bound to a lease.
///
/// Node identifiers may carry a `#ordinal` suffix for per-GPU slots
/// (e.g. `node-a#0`); [`LeaseSlice::node_names`] strips them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSlice {
    /// GPU slot identifiers
    pub nodes: Vec<String>,
    /// Role of the slice
    #[serde(default)]
    pub role: LeaseRole,
}

impl LeaseSlice {
    /// Slot count; an empty slice still counts as one GPU.
    pub fn quantity(&self) -> u32 {
        (self.nodes.len() as u32).max(1)
    }

    /// Node names with any `#ordinal` slot suffix stripped.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|slot| node_from_slot(slot))
    }

    /// Whether any slot lives on the named node.
    pub fn contains_node(&self, node: &str) -> bool {
        self.node_names().any(|n| n == node)
    }
}

/// Strips the `#ordinal` slot suffix from a slot identifier.
pub(crate) fn node_from_slot(slot: &str) -> &str {
    match slot.find('#') {
        Some(idx) => &slot[..idx],
        None => slot,
    }
}

/// Time bounds of a lease.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInterval {
    /// When consumption began
    pub start: DateTime<Utc>,
    /// Planned end, when known up front
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Immutable description of a consumption slice.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpec {
    /// Owner the consumption is attributed to
    pub owner: String,
    /// The Run holding the slice
    pub run_ref: RunReference,
    /// Bound nodes and role
    pub slice: LeaseSlice,
    /// Time bounds
    pub interval: LeaseInterval,
    /// Envelope paying for the slice; owned by `owner` or, for borrowed
    /// slices, by a sponsor whose lending ACL permits `owner`
    pub paid_by_envelope: String,
    /// Why the lease was created (Start, Grow, Swap)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Closure state; the only mutable part of a lease.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    /// Whether the lease has ended
    #[serde(default)]
    pub closed: bool,
    /// When it ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Why it ended (Shrink, NodeFailure, Swap, ReclaimedBySpare,
    /// DropSpare, RandomPreempt(seed))
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub closure_reason: String,
}

/// Immutable record of GPU consumption
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Object identity and labels
    pub metadata: Meta,
    /// Immutable slice description
    pub spec: LeaseSpec,
    /// Closure state
    #[serde(default)]
    pub status: LeaseStatus,
}

impl Lease {
    /// Whether the lease is consuming capacity at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if now < self.spec.interval.start {
            return false;
        }
        if let Some(end) = self.spec.interval.end {
            if now >= end {
                return false;
            }
        }
        if let Some(ended) = self.status.ended_at {
            if now >= ended {
                return false;
            }
        }
        true
    }

    /// Mark the lease closed. A no-op when already closed; the spec is
    /// never touched.
    pub fn close(&mut self, reason: &str, now: DateTime<Utc>) {
        if self.status.closed {
            return;
        }
        self.status.closed = true;
        self.status.ended_at = Some(now);
        self.status.closure_reason = reason.to_string();
    }

    /// Validate the spec; returns the first violation found.
    pub fn validate(&self) -> crate::Result<()> {
        let name = self.metadata.name.as_str();
        if self.spec.owner.is_empty() {
            return Err(Error::validation_for_field(name, "spec.owner", "is required"));
        }
        if self.spec.run_ref.name.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.runRef.name",
                "is required",
            ));
        }
        if self.spec.paid_by_envelope.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.paidByEnvelope",
                "is required",
            ));
        }
        if self.spec.slice.nodes.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.slice.nodes",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
