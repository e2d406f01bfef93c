//! Budget controller
//!
//! Recomputes Budget status from the lease ledger: per-envelope and per-cap
//! headroom, plus the budget and spare concurrency gauges.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::accounting::{
    aggregate_headroom, build_budget_state, envelope_headroom, Usage,
};
use crate::api::{Budget, BudgetStatus, CapHeadroomStatus, EnvelopeHeadroomStatus, Lease};
use crate::clock::{Clock, RealClock};
use crate::metrics;

/// Updates Budget status and metrics based on leases.
pub struct BudgetController<C: Clock = RealClock> {
    clock: C,
}

impl Default for BudgetController<RealClock> {
    fn default() -> Self {
        Self { clock: RealClock }
    }
}

impl BudgetController<RealClock> {
    /// Constructs a controller using the wall clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Clock> BudgetController<C> {
    /// Constructs a controller with an injected clock.
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }

    /// Computes headroom status for one budget and publishes its gauges.
    pub fn reconcile_budget(&self, budget: &Budget, leases: &[Lease]) -> BudgetStatus {
        let now = self.clock.now();
        self.reconcile_budget_at(budget, leases, now)
    }

    fn reconcile_budget_at(
        &self,
        budget: &Budget,
        leases: &[Lease],
        now: DateTime<Utc>,
    ) -> BudgetStatus {
        let state = build_budget_state(budget, leases, now);

        let mut headroom = Vec::with_capacity(state.envelopes.len());
        for env in state.envelopes.values() {
            let h = envelope_headroom(env, Usage::default());
            headroom.push(EnvelopeHeadroomStatus {
                name: env.spec.name.clone(),
                flavor: env.spec.flavor.clone(),
                concurrency: h.concurrency,
                gpu_hours: env
                    .spec
                    .max_gpu_hours
                    .and_then(|_| h.gpu_hours)
                    .map(|hours| hours.floor() as u64),
            });

            let borrowed = f64::from(env.usage.borrowed_concurrency);
            let spare = f64::from(env.usage.spare_concurrency);
            let owned = f64::from(
                env.usage
                    .concurrency
                    .saturating_sub(env.usage.borrowed_concurrency),
            );
            metrics::record_budget_usage(
                metrics::BudgetKey {
                    owner: env.owner.clone(),
                    budget: budget.metadata.name.clone(),
                    envelope: env.spec.name.clone(),
                    flavor: env.spec.flavor.clone(),
                },
                metrics::BudgetUsage {
                    owned,
                    borrowed,
                    spare,
                },
            );
        }

        let mut aggregate = Vec::with_capacity(state.aggregates.len());
        for cap in state.aggregates.values() {
            let h = aggregate_headroom(cap, Usage::default());
            aggregate.push(CapHeadroomStatus {
                name: cap.spec.name.clone(),
                flavor: cap.spec.flavor.clone(),
                concurrency: cap.spec.max_concurrency.map(|_| h.concurrency),
                gpu_hours: cap
                    .spec
                    .max_gpu_hours
                    .and_then(|_| h.gpu_hours)
                    .map(|hours| hours.floor() as u64),
            });
        }

        BudgetStatus {
            headroom,
            aggregate_headroom: aggregate,
            updated_at: Some(now),
        }
    }

    /// Reconciles every budget in place and refreshes the per-flavor spare
    /// usage gauges.
    pub fn reconcile_all(&self, budgets: &mut [Budget], leases: &[Lease]) {
        let now = self.clock.now();
        let mut spare_by_flavor: BTreeMap<String, f64> = BTreeMap::new();
        for budget in budgets.iter_mut() {
            let state = build_budget_state(budget, leases, now);
            for env in state.envelopes.values() {
                *spare_by_flavor.entry(env.spec.flavor.clone()).or_insert(0.0) +=
                    f64::from(env.usage.spare_concurrency);
            }
            budget.status = self.reconcile_budget_at(budget, leases, now);
        }
        for (flavor, value) in spare_by_flavor {
            metrics::set_spare_usage(&flavor, value);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
