//! Budget accounting
//!
//! Derives per-envelope and per-cap usage from the lease ledger at a given
//! instant: concurrency while a lease is active, cumulative GPU-hours over
//! its effective interval, split into owned / borrowed / spare classes.
//! Headroom is the non-negative remainder against the configured caps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::api::{AggregateCap, Budget, Envelope, Lease, LeaseRole};

/// Live and cumulative consumption attributed to an envelope or cap.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Usage {
    /// GPU slots active right now
    pub concurrency: u32,
    /// Cumulative GPU-hours over effective lease intervals
    pub gpu_hours: f64,
    /// Active slots funded for a borrower
    pub borrowed_concurrency: u32,
    /// Cumulative borrowed GPU-hours
    pub borrowed_gpu_hours: f64,
    /// Slots held as spares
    pub spare_concurrency: u32,
    /// Cumulative spare GPU-hours
    pub spare_gpu_hours: f64,
}

/// Remaining capacity for an envelope or aggregate cap.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Headroom {
    /// Remaining concurrent GPUs
    pub concurrency: u32,
    /// Remaining GPU-hours, when the envelope/cap is hour-capped
    pub gpu_hours: Option<f64>,
}

/// Consumption state for a single envelope.
#[derive(Clone, Debug)]
pub struct EnvelopeState {
    /// Name of the budget carrying the envelope
    pub budget_name: String,
    /// Budget owner
    pub owner: String,
    /// The envelope spec
    pub spec: Envelope,
    /// Derived usage
    pub usage: Usage,
    /// Names of aggregate caps containing this envelope
    pub aggregates: Vec<String>,
}

/// Consumption state for an aggregate cap.
#[derive(Clone, Debug)]
pub struct AggregateState {
    /// The cap spec
    pub spec: AggregateCap,
    /// Summed usage of member envelopes
    pub usage: Usage,
}

/// Usage summary for one Budget at a point in time.
#[derive(Clone, Debug)]
pub struct BudgetState {
    /// The budget this state was derived from
    pub budget: Budget,
    /// Envelope states keyed by envelope name
    pub envelopes: BTreeMap<String, EnvelopeState>,
    /// Aggregate cap states keyed by cap name
    pub aggregates: BTreeMap<String, AggregateState>,
}

impl BudgetState {
    /// Budget owner convenience accessor.
    pub fn owner(&self) -> &str {
        &self.budget.spec.owner
    }
}

/// Computes usage for all envelopes in a budget from the current leases.
///
/// Leases belonging to other owners or naming unknown envelopes are
/// ignored, so the whole ledger can be passed unfiltered.
pub fn build_budget_state(budget: &Budget, leases: &[Lease], now: DateTime<Utc>) -> BudgetState {
    let mut envelopes: BTreeMap<String, EnvelopeState> = budget
        .spec
        .envelopes
        .iter()
        .map(|env| {
            (
                env.name.clone(),
                EnvelopeState {
                    budget_name: budget.metadata.name.clone(),
                    owner: budget.spec.owner.clone(),
                    spec: env.clone(),
                    usage: Usage::default(),
                    aggregates: Vec::new(),
                },
            )
        })
        .collect();

    for lease in leases {
        if lease.spec.owner != budget.spec.owner {
            continue;
        }
        let Some(env_state) = envelopes.get_mut(&lease.spec.paid_by_envelope) else {
            continue;
        };
        let usage = compute_lease_usage(lease, now);
        env_state.usage.concurrency += usage.concurrency;
        env_state.usage.gpu_hours += usage.gpu_hours;
        if lease.spec.slice.role == LeaseRole::Borrowed {
            env_state.usage.borrowed_concurrency += usage.concurrency;
            env_state.usage.borrowed_gpu_hours += usage.gpu_hours;
        }
        if lease.spec.slice.role == LeaseRole::Spare {
            env_state.usage.spare_concurrency += usage.spare_concurrency;
            env_state.usage.spare_gpu_hours += usage.spare_gpu_hours;
        }
    }

    let mut aggregates: BTreeMap<String, AggregateState> = budget
        .spec
        .aggregate_caps
        .iter()
        .map(|cap| {
            (
                cap.name.clone(),
                AggregateState {
                    spec: cap.clone(),
                    usage: Usage::default(),
                },
            )
        })
        .collect();

    for (cap_name, agg) in aggregates.iter_mut() {
        for (name, env_state) in envelopes.iter_mut() {
            if !agg.spec.envelopes.contains(name) {
                continue;
            }
            agg.usage.concurrency += env_state.usage.concurrency;
            agg.usage.gpu_hours += env_state.usage.gpu_hours;
            agg.usage.spare_concurrency += env_state.usage.spare_concurrency;
            agg.usage.spare_gpu_hours += env_state.usage.spare_gpu_hours;
            env_state.aggregates.push(cap_name.clone());
        }
    }

    BudgetState {
        budget: budget.clone(),
        envelopes,
        aggregates,
    }
}

/// Usage contribution of one lease at `now`.
///
/// Quantity floors at one GPU; duration is the effective interval
/// `[start, min(end, endedAt, now)]`, clamped non-negative. Concurrency
/// counts only while the lease is active.
pub fn compute_lease_usage(lease: &Lease, now: DateTime<Utc>) -> Usage {
    let quantity = lease.spec.slice.quantity();
    let start = lease.spec.interval.start;
    let mut end = now;
    if let Some(planned) = lease.spec.interval.end {
        end = end.min(planned);
    }
    if let Some(ended) = lease.status.ended_at {
        end = end.min(ended);
    }
    if end < start {
        end = start;
    }
    let hours = ((end - start).num_milliseconds() as f64 / 3_600_000.0).max(0.0);

    let mut usage = Usage {
        gpu_hours: f64::from(quantity) * hours,
        ..Default::default()
    };
    if lease.is_active(now) {
        usage.concurrency = quantity;
    }
    if lease.spec.slice.role == LeaseRole::Spare {
        usage.spare_concurrency = quantity;
        usage.spare_gpu_hours = usage.gpu_hours;
    }
    usage
}

/// Remaining capacity for an envelope, given `additional` usage about to be
/// committed on top of what the leases already show.
pub fn envelope_headroom(env: &EnvelopeState, additional: Usage) -> Headroom {
    let used = env.usage.concurrency + additional.concurrency;
    let concurrency = env.spec.concurrency.saturating_sub(used);
    let gpu_hours = env.spec.max_gpu_hours.map(|max| {
        let used_hours = env.usage.gpu_hours + additional.gpu_hours;
        (max as f64 - used_hours).max(0.0)
    });
    Headroom {
        concurrency,
        gpu_hours,
    }
}

/// Remaining capacity for an aggregate cap. Unbounded dimensions report
/// `u32::MAX` concurrency / `None` hours.
pub fn aggregate_headroom(cap: &AggregateState, additional: Usage) -> Headroom {
    let concurrency = match cap.spec.max_concurrency {
        Some(max) => max.saturating_sub(cap.usage.concurrency + additional.concurrency),
        None => u32::MAX,
    };
    let gpu_hours = cap.spec.max_gpu_hours.map(|max| {
        let used = cap.usage.gpu_hours + additional.gpu_hours;
        (max as f64 - used).max(0.0)
    });
    Headroom {
        concurrency,
        gpu_hours,
    }
}

// =============================================================================
// Tests
// =============================================================================
