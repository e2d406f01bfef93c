//! Budget manifest types
//!
//! A Budget belongs to one owner in the family hierarchy and carries
//! envelopes (scoped concurrency / GPU-hour caps) plus aggregate caps that
//! bound groups of envelopes together. Lending policies on envelopes open
//! them to borrowers.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::Meta;
use crate::Error;

/// Controls whether an envelope may be referenced before its window opens.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreActivationPolicy {
    /// Reservations may target the envelope before `start`
    pub allow_reservations: bool,
    /// Immediate admission may use the envelope before `start`
    pub allow_admission: bool,
}

/// Opens an envelope to borrowers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LendingPolicy {
    /// Master switch for lending from this envelope
    pub allow: bool,
    /// Borrower owner patterns; exact match, `*`, or `prefix*`. Empty allows all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    /// Cap on concurrently lent GPUs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    /// Cap on cumulative lent GPU-hours
    #[serde(rename = "maxGPUHours", default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_hours: Option<u64>,
}

impl LendingPolicy {
    /// Whether `borrower` matches the `to` ACL. An empty list allows anyone.
    pub fn allows_borrower(&self, borrower: &str) -> bool {
        if !self.allow {
            return false;
        }
        if self.to.is_empty() {
            return true;
        }
        self.to.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            if let Some(prefix) = pattern.strip_suffix('*') {
                return borrower.starts_with(prefix);
            }
            pattern == borrower
        })
    }

    fn validate(&self) -> crate::Result<()> {
        if !self.allow {
            return Ok(());
        }
        if self.max_concurrency == Some(0) {
            return Err(Error::validation(
                "lending.maxConcurrency must be positive when set",
            ));
        }
        Ok(())
    }
}

/// A location/time scoped limit owned by one team.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Envelope name, unique within the budget
    pub name: String,
    /// GPU flavor the envelope funds
    pub flavor: String,
    /// Required label matches on {region, cluster, fabric.domain}; `*` is any
    pub selector: BTreeMap<String, String>,
    /// Concurrent GPU cap
    pub concurrency: u32,
    /// Cumulative GPU-hour cap
    #[serde(rename = "maxGPUHours", default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_hours: Option<u64>,
    /// Window opening time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// Window closing time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Pre-window reservation/admission policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_activation: Option<PreActivationPolicy>,
    /// Lending policy for sponsors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lending: Option<LendingPolicy>,
}

impl Envelope {
    /// Whether the envelope may fund an immediate admission at `now`.
    pub fn allows_admission(&self, now: DateTime<Utc>) -> bool {
        if let Some(start) = self.start {
            if now < start {
                return self
                    .pre_activation
                    .map(|p| p.allow_admission)
                    .unwrap_or(false);
            }
        }
        if let Some(end) = self.end {
            if now >= end {
                return false;
            }
        }
        true
    }

    /// Whether the selector matches a concrete location. Missing keys in the
    /// location fail the match unless the selector value is `*`.
    pub fn matches_location(&self, location: &BTreeMap<String, String>) -> bool {
        selector_matches(&self.selector, location)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("envelope name is required"));
        }
        if self.flavor.is_empty() {
            return Err(Error::validation("envelope flavor is required"));
        }
        if self.selector.is_empty() {
            return Err(Error::validation(
                "envelope selector must contain at least one label",
            ));
        }
        if self.concurrency == 0 {
            return Err(Error::validation("envelope concurrency must be positive"));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end <= start {
                return Err(Error::validation("envelope end must be after start"));
            }
            if let Some(max_hours) = self.max_gpu_hours {
                let window_hours = duration_hours(end - start);
                let limit = f64::from(self.concurrency) * window_hours;
                if max_hours as f64 > limit + 1e-6 {
                    return Err(Error::validation(
                        "envelope maxGPUHours exceeds concurrency x window",
                    ));
                }
            }
        }
        if let Some(lending) = &self.lending {
            lending.validate()?;
        }
        Ok(())
    }
}

/// Whether every selector entry matches the location; `*` matches anything.
pub(crate) fn selector_matches(
    selector: &BTreeMap<String, String>,
    location: &BTreeMap<String, String>,
) -> bool {
    for (key, sel) in selector {
        if sel == "*" {
            continue;
        }
        match location.get(key) {
            Some(value) if value == sel => {}
            _ => return false,
        }
    }
    true
}

/// Bounds the sum of usage across a set of envelopes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateCap {
    /// Cap name, unique within the budget
    pub name: String,
    /// Reported flavor of the cap
    pub flavor: String,
    /// Member envelope names
    pub envelopes: Vec<String>,
    /// Bound on concurrent GPUs across members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    /// Bound on cumulative GPU-hours across members
    #[serde(rename = "maxGPUHours", default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_hours: Option<u64>,
}

/// Reporting rotation for open-ended envelopes. Carried for round-tripping;
/// renewal itself happens outside the core.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoRenewSchedule {
    /// Rotation period in hours
    pub period_hours: u32,
    /// Notification lead in hours
    pub notify_before_hours: u32,
}

/// Desired state of a Budget
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSpec {
    /// Owning team in the family hierarchy
    pub owner: String,
    /// Envelopes constraining this owner's runs
    pub envelopes: Vec<Envelope>,
    /// Caps spanning multiple envelopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate_caps: Vec<AggregateCap>,
    /// Parent owners; defines the family sharing graph
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    /// Optional renewal schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_renew: Option<AutoRenewSchedule>,
}

/// Remaining capacity for one envelope, surfaced on Budget status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeadroomStatus {
    /// Envelope name
    pub name: String,
    /// Envelope flavor
    pub flavor: String,
    /// Remaining concurrent GPUs
    pub concurrency: u32,
    /// Remaining GPU-hours, when the envelope is hour-capped
    #[serde(rename = "gpuHours", default, skip_serializing_if = "Option::is_none")]
    pub gpu_hours: Option<u64>,
}

/// Remaining capacity for one aggregate cap.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapHeadroomStatus {
    /// Cap name
    pub name: String,
    /// Cap flavor
    pub flavor: String,
    /// Remaining concurrent GPUs, when bounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Remaining GPU-hours, when bounded
    #[serde(rename = "gpuHours", default, skip_serializing_if = "Option::is_none")]
    pub gpu_hours: Option<u64>,
}

/// Observed state of a Budget
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    /// Per-envelope remaining capacity
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headroom: Vec<EnvelopeHeadroomStatus>,
    /// Per-cap remaining capacity
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate_headroom: Vec<CapHeadroomStatus>,
    /// When the status was last recomputed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Allocation envelopes that constrain an owner's Runs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// Object identity
    pub metadata: Meta,
    /// Desired state
    pub spec: BudgetSpec,
    /// Observed state
    #[serde(default)]
    pub status: BudgetStatus,
}

impl Budget {
    /// Validate the spec; returns the first violation found.
    pub fn validate(&self) -> crate::Result<()> {
        if self.spec.owner.is_empty() {
            return Err(Error::validation_for_field(
                self.metadata.name.as_str(),
                "spec.owner",
                "is required",
            ));
        }
        if self.spec.envelopes.is_empty() {
            return Err(Error::validation_for_field(
                self.metadata.name.as_str(),
                "spec.envelopes",
                "must not be empty",
            ));
        }
        for (i, envelope) in self.spec.envelopes.iter().enumerate() {
            envelope.validate().map_err(|e| {
                Error::validation_for_field(
                    self.metadata.name.as_str(),
                    format!("spec.envelopes[{i}]"),
                    e.to_string(),
                )
            })?;
        }
        Ok(())
    }
}

fn duration_hours(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 3_600_000.0
}

// =============================================================================
// Tests
// =============================================================================
