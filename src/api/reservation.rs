//! Reservation manifest types
//!
//! When admission is blocked, the forecaster emits a Reservation: the slice
//! the Run intends to occupy, the envelope that will pay, and the earliest
//! start the controller is willing to promise. At most one reservation per
//! Run is Pending at any time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{Meta, RunReference};
use crate::Error;

/// Lifecycle state of a Reservation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReservationState {
    /// Waiting for its earliest start
    #[default]
    Pending,
    /// Activated and converted into leases
    Released,
    /// Withdrawn without activating
    Canceled,
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Released => write!(f, "Released"),
            Self::Canceled => write!(f, "Canceled"),
        }
    }
}

/// The topology a reservation intends to occupy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntendedSlice {
    /// Domain labels (region, cluster, fabric.domain)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub domain: BTreeMap<String, String>,
    /// Specific nodes, when a placement attempt got that far
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

/// Forecast attached to a reservation: how short the cluster is and what the
/// resolver will do about it at activation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReservationForecast {
    /// GPUs the scope is short by
    #[serde(rename = "deficitGPUs", default)]
    pub deficit_gpus: u32,
    /// Labels bounding where the deficit is measured
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scope: BTreeMap<String, String>,
    /// Ordered remedies the resolver will apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remedies: Vec<String>,
    /// "window-aligned" when the start follows an envelope window,
    /// "conservative" otherwise
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub confidence: String,
}

/// Immutable reservation plan.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSpec {
    /// The blocked Run
    pub run_ref: RunReference,
    /// Where the Run intends to land
    pub intended_slice: IntendedSlice,
    /// Envelope that will pay on activation
    pub paying_envelope: String,
    /// Earliest instant the activation sweep will consider
    pub earliest_start: DateTime<Utc>,
}

/// Observed state of a Reservation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReservationStatus {
    /// Lifecycle state
    #[serde(default)]
    pub state: ReservationState,
    /// Why the reservation exists (or how it ended)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// When activation started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// When the reservation was released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    /// When the reservation was canceled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
    /// Seconds until earliest start, at creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown_seconds: Option<i64>,
    /// Deficit forecast and remedies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<ReservationForecast>,
}

/// A planned future start for a blocked Run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    /// Object identity
    pub metadata: Meta,
    /// Immutable plan
    pub spec: ReservationSpec,
    /// Lifecycle state
    #[serde(default)]
    pub status: ReservationStatus,
}

impl Reservation {
    /// The `namespace/name` index key.
    pub fn key(&self) -> String {
        self.metadata.key()
    }

    /// Validate the spec; returns the first violation found.
    pub fn validate(&self) -> crate::Result<()> {
        let name = self.metadata.name.as_str();
        if self.spec.run_ref.name.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.runRef.name",
                "is required",
            ));
        }
        if self.spec.paying_envelope.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.payingEnvelope",
                "is required",
            ));
        }
        if self.spec.intended_slice.domain.is_empty() && self.spec.intended_slice.nodes.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.intendedSlice",
                "must set nodes or domain",
            ));
        }
        Ok(())
    }
}
