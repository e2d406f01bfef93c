//! Controllers
//!
//! [`RunController`] drives the admission pipeline for Runs against the
//! process-wide [`ClusterState`]: reconcile, elastic width changes, the
//! reservation activation sweep, and node-failure spare swaps.
//! [`BudgetController`] recomputes Budget status headroom and publishes the
//! budget usage gauges.
//!
//! All state mutation is serialized behind one logical writer: every entry
//! point takes the controller (and thus the state) by exclusive reference
//! for the duration of one call. Runs and Budgets are replaced atomically
//! by deep-copy-and-swap; leases are append-only with in-place closure.

mod budget;
mod run;

use std::collections::BTreeMap;

use crate::api::{Budget, Lease, Reservation, Run};
use crate::binder::PodManifest;
use crate::topology::SourceNode;

pub use budget::BudgetController;
pub use run::RunController;

/// In-memory view of the cluster: the sole shared resource of the core.
#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    /// Runs indexed by `namespace/name`
    pub runs: BTreeMap<String, Run>,
    /// Budgets for all owners
    pub budgets: Vec<Budget>,
    /// Source node inventory
    pub nodes: Vec<SourceNode>,
    /// Lease ledger; append-only, closure is the only mutation
    pub leases: Vec<Lease>,
    /// Pod manifests materialized by the binder
    pub pods: Vec<PodManifest>,
    /// Reservations indexed by `namespace/name`
    pub reservations: BTreeMap<String, Reservation>,
}

impl ClusterState {
    /// Inserts or replaces a run, keyed by `namespace/name`.
    pub fn upsert_run(&mut self, run: Run) -> String {
        let key = run.key();
        self.runs.insert(key.clone(), run);
        key
    }

    /// Looks up a lease by its `namespace/name` key.
    pub fn lease_mut(&mut self, key: &str) -> Option<&mut Lease> {
        self.leases.iter_mut().find(|l| l.metadata.key() == key)
    }
}
