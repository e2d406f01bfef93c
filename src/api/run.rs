//! Run manifest types
//!
//! A Run is the researcher-facing request: GPU flavor and count, optional
//! locality grouping, optional elastic width, optional borrowing, optional
//! spares. Status tracks the admission outcome and elastic bookkeeping.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::Meta;
use crate::Error;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a Run
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RunPhase {
    /// Waiting for admission (or blocked behind a reservation)
    #[default]
    Pending,
    /// GPUs bound; leases are active
    Running,
    /// Finished successfully; retained for introspection
    Completed,
    /// Ended without completing (preempted with no remaining GPUs, node loss)
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// GPU requirements of a Run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunResources {
    /// GPU product identifier (e.g. "H100-80GB"); matched by equality
    pub gpu_type: String,
    /// Total GPUs requested
    #[serde(rename = "totalGPUs")]
    pub total_gpus: u32,
}

/// Placement preferences
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunLocality {
    /// Shard the request into groups of this size
    #[serde(rename = "groupGPUs", default, skip_serializing_if = "Option::is_none")]
    pub group_gpus: Option<u32>,
    /// Whether groups may land in different fabric domains (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_cross_group_spread: Option<bool>,
}

/// Elastic width bounds for a malleable Run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunMalleability {
    /// Smallest width the run can operate at
    #[serde(rename = "minTotalGPUs")]
    pub min_total_gpus: u32,
    /// Largest width the run can use
    #[serde(rename = "maxTotalGPUs")]
    pub max_total_gpus: u32,
    /// Width changes happen in multiples of this step
    #[serde(rename = "stepGPUs")]
    pub step_gpus: u32,
    /// Target width; defaults to the maximum
    #[serde(rename = "desiredTotalGPUs", default, skip_serializing_if = "Option::is_none")]
    pub desired_total_gpus: Option<u32>,
}

/// Borrowing intent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunFunding {
    /// Whether sponsor envelopes may fund part of the request
    pub allow_borrow: bool,
    /// Upper bound on borrowed GPUs
    #[serde(rename = "maxBorrowGPUs", default, skip_serializing_if = "Option::is_none")]
    pub max_borrow_gpus: Option<u32>,
    /// Sponsor owners to borrow from, in preference order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sponsors: Vec<String>,
}

/// Desired state of a Run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    /// Owning team, family-scoped (e.g. "org:research:vision")
    pub owner: String,
    /// GPU requirements
    pub resources: RunResources,
    /// Placement preferences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<RunLocality>,
    /// Elastic width bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malleable: Option<RunMalleability>,
    /// Borrowing intent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding: Option<RunFunding>,
    /// Extra GPUs per group reserved for fast swap on node failure
    #[serde(rename = "sparesPerGroup", default, skip_serializing_if = "Option::is_none")]
    pub spares_per_group: Option<u32>,
}

// =============================================================================
// Status
// =============================================================================

/// Elastic width bookkeeping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidthStatus {
    /// Lower width bound
    #[serde(default)]
    pub min: u32,
    /// Upper width bound
    #[serde(default)]
    pub max: u32,
    /// Target width
    #[serde(default)]
    pub desired: u32,
    /// Active non-spare GPU slots currently leased
    #[serde(default)]
    pub allocated: u32,
    /// Outstanding resize, e.g. "Grow to 16"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pending: String,
}

/// A sponsor's contribution to a running Run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SponsorShare {
    /// Sponsor owner string
    pub owner: String,
    /// Borrowed GPU slots currently active
    #[serde(rename = "gpus", default)]
    pub gpus: u32,
    /// Accrued borrowed GPU-hours
    #[serde(rename = "gpuHours", default)]
    pub gpu_hours: f64,
}

/// Funding summary for a Run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunFundingStatus {
    /// Active GPU slots paid by the owner's own envelopes
    #[serde(rename = "ownedGPUs", default)]
    pub owned_gpus: u32,
    /// Accrued owned GPU-hours
    #[serde(rename = "ownedGPUHours", default)]
    pub owned_gpu_hours: f64,
    /// Active borrowed GPU slots
    #[serde(rename = "borrowedGPUs", default)]
    pub borrowed_gpus: u32,
    /// Accrued borrowed GPU-hours
    #[serde(rename = "borrowedGPUHours", default)]
    pub borrowed_gpu_hours: f64,
    /// Per-sponsor breakdown of borrowed capacity
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sponsors: Vec<SponsorShare>,
}

/// Observed state of a Run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: RunPhase,
    /// Human-readable detail on the current state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Name of the pending reservation, when blocked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_reservation: Option<String>,
    /// Earliest start promised by the pending reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_start: Option<DateTime<Utc>>,
    /// Elastic width bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<WidthStatus>,
    /// Funding summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding: Option<RunFundingStatus>,
}

// =============================================================================
// Run
// =============================================================================

/// A researcher's training job request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Object identity and labels
    pub metadata: Meta,
    /// Desired state
    pub spec: RunSpec,
    /// Observed state
    #[serde(default)]
    pub status: RunStatus,
}

impl Run {
    /// The `namespace/name` index key.
    pub fn key(&self) -> String {
        self.metadata.key()
    }

    /// Apply defaults: cross-group spread on unless declined, desired width
    /// at the malleable maximum when unset.
    pub fn default_fields(&mut self) {
        let locality = self.spec.locality.get_or_insert_with(RunLocality::default);
        if locality.allow_cross_group_spread.is_none() {
            locality.allow_cross_group_spread = Some(true);
        }
        if let Some(malleable) = self.spec.malleable.as_mut() {
            if malleable.desired_total_gpus.is_none() {
                malleable.desired_total_gpus = Some(malleable.max_total_gpus);
            }
        }
    }

    /// Effective cross-group spread setting.
    pub fn allow_cross_group_spread(&self) -> bool {
        self.spec
            .locality
            .as_ref()
            .and_then(|l| l.allow_cross_group_spread)
            .unwrap_or(true)
    }

    /// Effective group size, when locality sharding is requested.
    pub fn group_gpus(&self) -> Option<u32> {
        self.spec.locality.as_ref().and_then(|l| l.group_gpus)
    }

    /// Spares requested per group.
    pub fn spares_per_group(&self) -> u32 {
        self.spec.spares_per_group.unwrap_or(0)
    }

    /// Validate the spec; returns the first violation found.
    pub fn validate(&self) -> crate::Result<()> {
        let name = self.metadata.name.as_str();
        if self.spec.owner.is_empty() {
            return Err(Error::validation_for_field(name, "spec.owner", "is required"));
        }
        if self.spec.resources.gpu_type.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.resources.gpuType",
                "is required",
            ));
        }
        if self.spec.resources.total_gpus == 0 {
            return Err(Error::validation_for_field(
                name,
                "spec.resources.totalGPUs",
                "must be positive",
            ));
        }
        if let Some(locality) = &self.spec.locality {
            if locality.group_gpus == Some(0) {
                return Err(Error::validation_for_field(
                    name,
                    "spec.locality.groupGPUs",
                    "must be positive when set",
                ));
            }
        }
        if let Some(m) = &self.spec.malleable {
            if m.min_total_gpus == 0 || m.max_total_gpus == 0 {
                return Err(Error::validation_for_field(
                    name,
                    "spec.malleable",
                    "min/max must be positive",
                ));
            }
            if m.step_gpus == 0 {
                return Err(Error::validation_for_field(
                    name,
                    "spec.malleable.stepGPUs",
                    "must be positive",
                ));
            }
            if m.min_total_gpus > m.max_total_gpus {
                return Err(Error::validation_for_field(
                    name,
                    "spec.malleable.minTotalGPUs",
                    "must be <= maxTotalGPUs",
                ));
            }
            let total = self.spec.resources.total_gpus;
            if total < m.min_total_gpus || total > m.max_total_gpus {
                return Err(Error::validation_for_field(
                    name,
                    "spec.resources.totalGPUs",
                    "must fall within malleable min/max",
                ));
            }
            if (total - m.min_total_gpus) % m.step_gpus != 0 {
                return Err(Error::validation_for_field(
                    name,
                    "spec.resources.totalGPUs",
                    "must align with malleable.stepGPUs",
                ));
            }
            if let Some(desired) = m.desired_total_gpus {
                if desired < m.min_total_gpus || desired > m.max_total_gpus {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.malleable.desiredTotalGPUs",
                        "must fall within min/max",
                    ));
                }
                if (desired - m.min_total_gpus) % m.step_gpus != 0 {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.malleable.desiredTotalGPUs",
                        "must align with stepGPUs",
                    ));
                }
            }
        }
        if let Some(funding) = &self.spec.funding {
            if funding.allow_borrow && funding.max_borrow_gpus == Some(0) {
                return Err(Error::validation_for_field(
                    name,
                    "spec.funding.maxBorrowGPUs",
                    "must be positive when set",
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn base_run() -> Run {
        Run {
            metadata: Meta::named("train-llm"),
            spec: RunSpec {
                owner: "org:research".to_string(),
                resources: RunResources {
                    gpu_type: "H100-80GB".to_string(),
                    total_gpus: 8,
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn valid_run_passes() {
        assert!(base_run().validate().is_ok());
    }

    #[test]
    fn zero_gpus_rejected() {
        let mut run = base_run();
        run.spec.resources.total_gpus = 0;
        let err = run.validate().unwrap_err();
        assert!(err.to_string().contains("totalGPUs"));
    }

    #[test]
    fn missing_owner_rejected() {
        let mut run = base_run();
        run.spec.owner.clear();
        assert!(run.validate().is_err());
    }

    #[test]
    fn malleable_bounds_enforced() {
        let mut run = base_run();
        run.spec.malleable = Some(RunMalleability {
            min_total_gpus: 4,
            max_total_gpus: 16,
            step_gpus: 4,
            desired_total_gpus: None,
        });
        assert!(run.validate().is_ok());

        // total outside [min, max]
        run.spec.resources.total_gpus = 2;
        assert!(run.validate().is_err());

        // total not step-aligned
        run.spec.resources.total_gpus = 6;
        assert!(run.validate().is_err());

        // desired not step-aligned
        run.spec.resources.total_gpus = 8;
        run.spec.malleable.as_mut().unwrap().desired_total_gpus = Some(10);
        assert!(run.validate().is_err());
    }

    #[test]
    fn malleable_min_above_max_rejected() {
        let mut run = base_run();
        run.spec.malleable = Some(RunMalleability {
            min_total_gpus: 16,
            max_total_gpus: 8,
            step_gpus: 4,
            desired_total_gpus: None,
        });
        assert!(run.validate().is_err());
    }

    #[test]
    fn defaults_fill_spread_and_desired() {
        let mut run = base_run();
        run.spec.malleable = Some(RunMalleability {
            min_total_gpus: 8,
            max_total_gpus: 16,
            step_gpus: 8,
            desired_total_gpus: None,
        });
        run.default_fields();
        assert_eq!(
            run.spec.locality.as_ref().unwrap().allow_cross_group_spread,
            Some(true)
        );
        assert_eq!(
            run.spec.malleable.as_ref().unwrap().desired_total_gpus,
            Some(16)
        );
    }

    #[test]
    fn serde_round_trip_uses_gpu_field_names() {
        let mut run = base_run();
        run.spec.locality = Some(RunLocality {
            group_gpus: Some(4),
            allow_cross_group_spread: Some(false),
        });
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["spec"]["resources"]["totalGPUs"], 8);
        assert_eq!(json["spec"]["locality"]["groupGPUs"], 4);
        let back: Run = serde_json::from_value(json).unwrap();
        assert_eq!(back, run);
    }

    #[test]
    fn phase_display() {
        assert_eq!(RunPhase::Pending.to_string(), "Pending");
        assert_eq!(RunPhase::Running.to_string(), "Running");
        assert_eq!(RunPhase::Completed.to_string(), "Completed");
        assert_eq!(RunPhase::Failed.to_string(), "Failed");
    }
}
