//! Reservation forecaster
//!
//! When pack or cover rejects a Run with a capacity-shaped failure, the
//! forecaster turns the rejection into a Reservation plan: where the Run
//! intends to land, which envelope will pay, the earliest start worth
//! promising, how many GPUs the scope is short, and the remedies the
//! resolver will apply at activation.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::accounting::{envelope_headroom, BudgetState, Usage};
use crate::api::{IntendedSlice, ReservationForecast, Run};
use crate::{cover, pack, topology};

/// Conservative delay used when no precise start can be inferred.
pub const DEFAULT_ACTIVATION_LEAD_SECS: i64 = 15 * 60;
/// Floor so we never promise activation in the past.
pub const MINIMUM_ACTIVATION_LEAD_SECS: i64 = 60;
/// Offset past an envelope window opening, absorbing binder jitter.
pub const WINDOW_ACTIVATION_OFFSET_SECS: i64 = 10;

/// Errors from forecasting; these leave the Run Pending without a
/// reservation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ForecastError {
    /// No envelope owned by the run's owner matches flavor and scope.
    #[error("no matching envelopes found for run {run}")]
    NoEnvelope {
        /// Run name
        run: String,
    },
    /// The chosen envelope forbids reservations before its window opens.
    #[error("envelope {envelope} does not allow reservations before start")]
    ReservationsNotAllowed {
        /// Envelope name
        envelope: String,
    },
}

/// Context for deriving a reservation plan.
pub struct Input<'a> {
    /// The blocked run
    pub run: &'a Run,
    /// Current instant
    pub now: DateTime<Utc>,
    /// Topology snapshot from the failed attempt, when available
    pub snapshot: Option<&'a topology::Snapshot>,
    /// Pack plan, when pack succeeded and cover failed
    pub pack_plan: Option<&'a pack::Plan>,
    /// The pack failure, when placement was the blocker
    pub pack_err: Option<&'a pack::PlanError>,
    /// The cover failure, when funding was the blocker
    pub cover_err: Option<&'a cover::PlanError>,
    /// The cover request that was attempted
    pub cover_request: &'a cover::Request,
    /// Budget states at `now`
    pub budget_states: &'a [BudgetState],
}

/// The reservation plan emitted by the forecaster.
#[derive(Clone, Debug, PartialEq)]
pub struct Forecast {
    /// Scope labels and candidate nodes the run intends to occupy
    pub intended_slice: IntendedSlice,
    /// Envelope that will pay on activation
    pub paying_envelope: String,
    /// Earliest instant the activation sweep should consider
    pub earliest_start: DateTime<Utc>,
    /// Deficit, scope, remedies, and confidence for status reporting
    pub forecast: ReservationForecast,
    /// Human-readable reason for the reservation
    pub reason: String,
}

/// Determines how to represent a reservation for a run that cannot start
/// immediately.
pub fn plan(input: Input<'_>) -> Result<Forecast, ForecastError> {
    let scope = derive_scope(&input);
    let envelope = select_envelope(&input, &scope)?;
    let intended_slice = derive_slice(&input, &scope);

    let window_aligned = matches!(envelope.start, Some(start) if input.now < start)
        && envelope
            .pre_activation
            .map(|p| p.allow_reservations)
            .unwrap_or(true);
    let earliest_start = earliest(&input, &envelope, window_aligned);

    let deficit = estimate_deficit(&input);
    let forecast = ReservationForecast {
        deficit_gpus: deficit,
        scope: scope.clone(),
        remedies: default_remedies(),
        confidence: if window_aligned {
            "window-aligned".to_string()
        } else {
            "conservative".to_string()
        },
    };
    let reason = build_reason(&input, &envelope, deficit);

    Ok(Forecast {
        intended_slice,
        paying_envelope: envelope.name,
        earliest_start,
        forecast,
        reason,
    })
}

/// Scope preference: the attempted location, else the first packed group's
/// domain, else the largest free domain, else empty.
fn derive_scope(input: &Input<'_>) -> BTreeMap<String, String> {
    if !input.cover_request.location.is_empty() {
        return input.cover_request.location.clone();
    }
    if let Some(plan) = input.pack_plan {
        if let Some(group) = plan.groups.first() {
            return group.domain.as_labels();
        }
    }
    if let Some(snapshot) = input.snapshot {
        if let Some(domain) = snapshot.largest_domain() {
            return domain.key.as_labels();
        }
    }
    BTreeMap::new()
}

/// Scope labels plus the deduped, sorted union of planned node placements.
fn derive_slice(input: &Input<'_>, scope: &BTreeMap<String, String>) -> IntendedSlice {
    let mut slice = IntendedSlice {
        domain: scope.clone(),
        nodes: Vec::new(),
    };
    if let Some(plan) = input.pack_plan {
        let mut nodes: Vec<String> = plan
            .groups
            .iter()
            .flat_map(|g| g.node_placements.iter())
            .map(|a| a.node.clone())
            .collect();
        nodes.sort();
        nodes.dedup();
        slice.nodes = nodes;
    }
    slice
}

/// Ascending-name first envelope owned by the run's owner, flavor-matched
/// and selector-compatible with the scope.
fn select_envelope(
    input: &Input<'_>,
    scope: &BTreeMap<String, String>,
) -> Result<crate::api::Envelope, ForecastError> {
    let run = input.run;
    let mut candidates: Vec<&crate::api::Envelope> = Vec::new();
    for state in input.budget_states {
        if state.owner() != run.spec.owner {
            continue;
        }
        for env in state.envelopes.values() {
            if env.spec.flavor != run.spec.resources.gpu_type {
                continue;
            }
            if !scope.is_empty() && !selector_compatible(&env.spec.selector, scope) {
                continue;
            }
            candidates.push(&env.spec);
        }
    }
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    let selected = candidates.first().ok_or_else(|| ForecastError::NoEnvelope {
        run: run.metadata.name.clone(),
    })?;
    if let Some(start) = selected.start {
        if input.now < start {
            if let Some(pre) = selected.pre_activation {
                if !pre.allow_reservations {
                    return Err(ForecastError::ReservationsNotAllowed {
                        envelope: selected.name.clone(),
                    });
                }
            }
        }
    }
    Ok((*selected).clone())
}

/// Compatibility is looser than a location match: selector keys absent from
/// the scope are unconstrained.
fn selector_compatible(
    selector: &BTreeMap<String, String>,
    scope: &BTreeMap<String, String>,
) -> bool {
    for (key, value) in selector {
        if let Some(scope_value) = scope.get(key) {
            if scope_value != value && value != "*" {
                return false;
            }
        }
    }
    true
}

fn earliest(
    input: &Input<'_>,
    envelope: &crate::api::Envelope,
    window_aligned: bool,
) -> DateTime<Utc> {
    if window_aligned {
        if let Some(start) = envelope.start {
            let aligned = start + Duration::seconds(WINDOW_ACTIVATION_OFFSET_SECS);
            let floor = input.now + Duration::seconds(MINIMUM_ACTIVATION_LEAD_SECS);
            return aligned.max(floor);
        }
    }
    input.now + Duration::seconds(DEFAULT_ACTIVATION_LEAD_SECS)
}

/// Derives the deficit from whichever planner failed.
fn estimate_deficit(input: &Input<'_>) -> u32 {
    let total = input.run.spec.resources.total_gpus;
    if let Some(err) = input.pack_err {
        return match err.reason {
            pack::FailureReason::InsufficientCapacity => {
                let free = input.snapshot.map(|s| s.total_free_gpus()).unwrap_or(0);
                total.saturating_sub(free)
            }
            _ => total,
        };
    }
    if let Some(err) = input.cover_err {
        return match err.reason {
            cover::FailureReason::InsufficientCapacity => {
                total.saturating_sub(owner_headroom(input))
            }
            _ => total,
        };
    }
    total
}

/// Concurrency headroom across the owner's flavor-matched envelopes.
fn owner_headroom(input: &Input<'_>) -> u32 {
    let run = input.run;
    input
        .budget_states
        .iter()
        .filter(|state| state.owner() == run.spec.owner)
        .flat_map(|state| state.envelopes.values())
        .filter(|env| env.spec.flavor == run.spec.resources.gpu_type)
        .map(|env| envelope_headroom(env, Usage::default()).concurrency)
        .sum()
}

fn default_remedies() -> Vec<String> {
    vec![
        "Drop spares in scope".to_string(),
        "Shrink elastic runs by step size".to_string(),
        "Run fair lottery if deficit remains".to_string(),
    ]
}

fn build_reason(input: &Input<'_>, envelope: &crate::api::Envelope, deficit: u32) -> String {
    if let Some(err) = input.cover_err {
        match err.reason {
            cover::FailureReason::NoMatchingEnvelope => {
                if let Some(start) = envelope.start {
                    if input.now < start {
                        return format!("budget window opens at {}", start.to_rfc3339());
                    }
                }
                return "no eligible envelope available".to_string();
            }
            cover::FailureReason::InsufficientCapacity => {
                return format!("budget headroom short by {deficit} GPUs");
            }
            cover::FailureReason::AclDenied => {
                return "borrowing policy rejected request".to_string();
            }
            cover::FailureReason::InvalidRequest => {}
        }
    }
    if let Some(err) = input.pack_err {
        match err.reason {
            pack::FailureReason::InsufficientCapacity => {
                return format!("cluster short by {deficit} GPUs in scope");
            }
            pack::FailureReason::InsufficientTopology => {
                return "no single domain satisfies run grouping".to_string();
            }
            pack::FailureReason::InvalidRequest => {}
        }
    }
    "reservation pending".to_string()
}

// =============================================================================
// Tests
// =============================================================================
