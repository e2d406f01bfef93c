//! Run controller
//!
//! Reconciles Runs through the admission pipeline: snapshot, pack, cover,
//! bind, with the forecaster absorbing capacity failures into Reservations.
//! Also drives elastic grow/shrink for malleable Runs, the reservation
//! activation sweep (invoking the resolver on remaining deficits), and
//! node-failure spare swaps.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::accounting::{build_budget_state, compute_lease_usage, BudgetState};
use crate::api::{
    namespaced_key, Lease, LeaseRole, Meta, Reservation, ReservationSpec, ReservationState,
    ReservationStatus, Run, RunFundingStatus, RunPhase, RunReference, SponsorShare, WidthStatus,
};
use crate::binder::{self, PodManifest, LABEL_GROUP_INDEX, LABEL_ROLE, LABEL_RUN_NAME};
use crate::clock::{Clock, RealClock};
use crate::controller::ClusterState;
use crate::topology::{build_snapshot_for_flavor, Snapshot};
use crate::{cover, forecast, metrics, pack, resolver, Error, Result};

/// Drives admissions against the local cluster state.
pub struct RunController<C: Clock = RealClock> {
    state: ClusterState,
    clock: C,
}

impl RunController<RealClock> {
    /// Constructs a controller over `state` using the wall clock.
    pub fn new(state: ClusterState) -> Self {
        Self::with_clock(state, RealClock)
    }
}

impl<C: Clock> RunController<C> {
    /// Constructs a controller with an injected clock.
    pub fn with_clock(state: ClusterState, clock: C) -> Self {
        Self { state, clock }
    }

    /// The current instant according to the controller's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Read access to the cluster state.
    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Write access to the cluster state, for the host layer.
    pub fn state_mut(&mut self) -> &mut ClusterState {
        &mut self.state
    }

    /// Consumes the controller, returning the state for persistence.
    pub fn into_state(self) -> ClusterState {
        self.state
    }

    /// Reconciles every run, in ascending key order.
    pub fn reconcile_all(&mut self) -> Result<()> {
        let keys: Vec<String> = self.state.runs.keys().cloned().collect();
        for key in keys {
            let (namespace, name) = key
                .split_once('/')
                .map(|(ns, n)| (ns.to_string(), n.to_string()))
                .unwrap_or_else(|| (String::new(), key.clone()));
            self.reconcile(&namespace, &name)?;
        }
        Ok(())
    }

    /// Admits the run identified by namespace/name when feasible.
    pub fn reconcile(&mut self, namespace: &str, name: &str) -> Result<()> {
        let key = namespaced_key(namespace, name);
        let started = std::time::Instant::now();
        let mut run = self
            .state
            .runs
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found("Run", key.as_str()))?;

        if run.status.phase == RunPhase::Completed {
            run.status.width = Some(summarize_run_width(&run, &self.state.leases));
            self.state.runs.insert(key, run);
            return Ok(());
        }

        let now = self.clock.now();
        let flavor = run.spec.resources.gpu_type.clone();
        let usage = compute_usage(&self.state.leases, now);
        let snapshot = match build_snapshot_for_flavor(&self.state.nodes, &usage, &flavor) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(run = %key, error = %err, "topology snapshot failed");
                run.status.phase = RunPhase::Pending;
                run.status.message = err.to_string();
                run.status.width = Some(summarize_run_width(&run, &self.state.leases));
                return self.finish(key, run, &flavor, started, "pending");
            }
        };

        let states = self.budget_states(now);
        run.status.width = Some(summarize_run_width(&run, &self.state.leases));

        if run.status.phase == RunPhase::Running {
            if run.spec.malleable.is_some() {
                self.reconcile_elastic(&mut run, &snapshot, &states, now)?;
                run.status.width = Some(summarize_run_width(&run, &self.state.leases));
            }
            self.state.runs.insert(key, run);
            return Ok(());
        }

        let pack_plan = match plan_placement(&run, &snapshot) {
            Ok(plan) => plan,
            Err(err) if err.reason != pack::FailureReason::InvalidRequest => {
                let request = base_cover_request(&run, BTreeMap::new(), now);
                self.plan_reservation(
                    &mut run,
                    Some(&snapshot),
                    None,
                    Some(&err),
                    None,
                    &states,
                    request,
                    now,
                )?;
                let result = reservation_result(&run);
                return self.finish(key, run, &flavor, started, result);
            }
            Err(err) => {
                run.status.phase = RunPhase::Pending;
                run.status.message = err.to_string();
                return self.finish(key, run, &flavor, started, "pending");
            }
        };

        let location = derive_location(&pack_plan);
        let mut request = base_cover_request(&run, location, now);
        request.quantity = run.spec.resources.total_gpus + pack_plan.total_spares;

        let inventory = cover::Inventory::new(&states);
        let cover_plan = match inventory.plan(&request) {
            Ok(plan) => plan,
            Err(err) if err.reason != cover::FailureReason::InvalidRequest => {
                self.plan_reservation(
                    &mut run,
                    Some(&snapshot),
                    Some(&pack_plan),
                    None,
                    Some(&err),
                    &states,
                    request,
                    now,
                )?;
                let result = reservation_result(&run);
                return self.finish(key, run, &flavor, started, result);
            }
            Err(err) => {
                run.status.phase = RunPhase::Pending;
                run.status.message = err.to_string();
                return self.finish(key, run, &flavor, started, "pending");
            }
        };

        let bound = match binder::materialize(binder::Request {
            run: &run,
            pack_plan: &pack_plan,
            cover_plan: &cover_plan,
            now,
            group_index_offset: 0,
            lease_reason: "",
        }) {
            Ok(bound) => bound,
            Err(err) => {
                metrics::observe_admission(&flavor, "error", started.elapsed().as_secs_f64());
                return Err(err.into());
            }
        };
        self.state.pods.extend(bound.pods);
        self.state.leases.extend(bound.leases);

        run.status.phase = RunPhase::Running;
        run.status.message = format!("bound {} GPUs", pack_plan.total_gpus);
        run.status.pending_reservation = None;
        run.status.earliest_start = None;
        run.status.width = Some(summarize_run_width(&run, &self.state.leases));
        run.status.funding = Some(summarize_run_funding(&run, &self.state, now));
        info!(run = %key, gpus = pack_plan.total_gpus, spares = pack_plan.total_spares, "bound run");
        self.finish(key, run, &flavor, started, "bound")
    }

    /// Attempts to start any due reservations, invoking the resolver if
    /// deficits remain. Pending reservations are visited in ascending key
    /// order.
    pub fn activate_reservations(&mut self, now: DateTime<Utc>) -> Result<()> {
        let due: Vec<String> = self
            .state
            .reservations
            .iter()
            .filter(|(_, res)| {
                res.status.state == ReservationState::Pending
                    && res.spec.earliest_start <= now
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.activate_reservation(&key, now)?;
        }
        Ok(())
    }

    fn activate_reservation(&mut self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let reservation = self
            .state
            .reservations
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("Reservation", key))?;
        let run_key = reservation.spec.run_ref.key();
        let mut run = self
            .state
            .runs
            .get(&run_key)
            .cloned()
            .ok_or_else(|| Error::not_found("Run", run_key.as_str()))?;
        let flavor = run.spec.resources.gpu_type.clone();

        let usage = compute_usage(&self.state.leases, now);
        let mut snapshot = build_snapshot_for_flavor(&self.state.nodes, &usage, &flavor)?;
        let mut states = self.budget_states(now);

        let (mut pack_plan, pack_err) = match plan_placement(&run, &snapshot) {
            Ok(plan) => (Some(plan), None),
            Err(err) if err.reason == pack::FailureReason::InsufficientCapacity => {
                (None, Some(err))
            }
            Err(err) => return Err(err.into()),
        };

        let location = reservation.spec.intended_slice.domain.clone();
        let mut request = base_cover_request(&run, location, now);
        let spare_total = pack_plan
            .as_ref()
            .map(|p| p.total_spares)
            .unwrap_or_else(|| expected_spare_total(&run, None));
        request.quantity = run.spec.resources.total_gpus + spare_total;

        let mut cover_plan = {
            let inventory = cover::Inventory::new(&states);
            match inventory.plan(&request) {
                Ok(plan) => Some(plan),
                Err(err) if err.reason == cover::FailureReason::InsufficientCapacity => None,
                Err(err) => return Err(err.into()),
            }
        };

        if pack_err.is_some() || cover_plan.is_none() {
            let scope = if reservation.spec.intended_slice.domain.is_empty() {
                pack_plan
                    .as_ref()
                    .map(derive_location)
                    .unwrap_or_default()
            } else {
                reservation.spec.intended_slice.domain.clone()
            };
            let total_needed = run.spec.resources.total_gpus + spare_total;
            let mut deficit = compute_deficit(&snapshot, &scope, total_needed);
            if deficit == 0 {
                deficit = total_needed;
            }

            let outcome = resolver::resolve(resolver::Input {
                deficit,
                flavor: flavor.clone(),
                scope,
                seed_source: reservation.metadata.name.clone(),
                now,
                nodes: &self.state.nodes,
                leases: &self.state.leases,
                runs: &self.state.runs,
            })?;
            info!(
                reservation = %key,
                actions = outcome.actions.len(),
                seed = %outcome.seed,
                "resolver cleared capacity for reservation"
            );
            self.apply_resolution(&outcome, now);

            // Retry the pipeline once on the post-resolution state.
            let usage = compute_usage(&self.state.leases, now);
            snapshot = build_snapshot_for_flavor(&self.state.nodes, &usage, &flavor)?;
            pack_plan = Some(plan_placement(&run, &snapshot)?);
            states = self.budget_states(now);
            let spare_total = pack_plan
                .as_ref()
                .map(|p| p.total_spares)
                .unwrap_or_default();
            request.quantity = run.spec.resources.total_gpus + spare_total;
            let inventory = cover::Inventory::new(&states);
            cover_plan = Some(inventory.plan(&request)?);
        }

        let (Some(pack_plan), Some(cover_plan)) = (pack_plan, cover_plan) else {
            return Err(Error::internal(
                "activation",
                "plans missing after resolver retry",
            ));
        };
        let bound = binder::materialize(binder::Request {
            run: &run,
            pack_plan: &pack_plan,
            cover_plan: &cover_plan,
            now,
            group_index_offset: 0,
            lease_reason: "",
        })?;
        self.state.pods.extend(bound.pods);
        self.state.leases.extend(bound.leases);

        if let Some(res) = self.state.reservations.get_mut(key) {
            res.status.state = ReservationState::Released;
            res.status.reason = "Activated".to_string();
            res.status.activated_at = Some(now);
            res.status.released_at = Some(now);
            res.status.countdown_seconds = None;
        }

        run.status.phase = RunPhase::Running;
        run.status.message = format!("reservation {} activated", reservation.metadata.name);
        run.status.pending_reservation = None;
        run.status.earliest_start = None;
        run.status.width = Some(summarize_run_width(&run, &self.state.leases));
        run.status.funding = Some(summarize_run_funding(&run, &self.state, now));
        self.state.runs.insert(run_key, run);

        metrics::set_reservation_backlog(&flavor, 0.0);
        Ok(())
    }

    /// Performs a spare swap for every active lease touching a failed node.
    pub fn handle_node_failure(&mut self, node_name: &str, now: DateTime<Utc>) -> Result<()> {
        let initial = self.state.leases.len();
        let mut handled = false;

        for i in 0..initial {
            {
                let lease = &self.state.leases[i];
                if lease.status.closed
                    || lease.spec.slice.role == LeaseRole::Spare
                    || !lease.spec.slice.contains_node(node_name)
                {
                    continue;
                }
            }
            handled = true;
            let run_key = self.state.leases[i].spec.run_ref.key();
            let group = self.state.leases[i]
                .metadata
                .labels
                .get(LABEL_GROUP_INDEX)
                .cloned()
                .unwrap_or_else(|| "0".to_string());

            if !self.state.runs.contains_key(&run_key) {
                self.state.leases[i].close("NodeFailure", now);
                continue;
            }

            let spare_idx = find_spare_lease(&self.state.leases, &run_key, &group);
            let Some(spare_idx) = spare_idx else {
                self.state.leases[i].close("NodeFailure", now);
                if let Some(run) = self.state.runs.get_mut(&run_key) {
                    run.status.phase = RunPhase::Failed;
                    run.status.message =
                        format!("node {node_name} failed without spare coverage");
                }
                warn!(run = %run_key, node = %node_name, "no spare coverage for failed node");
                continue;
            };

            let spare_slots = self.state.leases[spare_idx].spec.slice.nodes.clone();
            let spare_envelope = self.state.leases[spare_idx].spec.paid_by_envelope.clone();
            let mut spare_nodes: BTreeMap<String, u32> = BTreeMap::new();
            for slot in &spare_slots {
                *spare_nodes
                    .entry(crate::api::node_from_slot(slot).to_string())
                    .or_insert(0) += 1;
            }

            // Anything else squatting on the spare's nodes loses them.
            for j in 0..self.state.leases.len() {
                if j == i || j == spare_idx {
                    continue;
                }
                let overlaps = {
                    let other = &self.state.leases[j];
                    !other.status.closed
                        && other
                            .spec
                            .slice
                            .node_names()
                            .any(|n| spare_nodes.contains_key(n))
                };
                if overlaps {
                    self.state.leases[j].close("ReclaimedBySpare", now);
                }
            }
            self.state.leases[spare_idx].close("Swap", now);
            self.state.leases[i].close("NodeFailure", now);

            let Some(run) = self.state.runs.get(&run_key).cloned() else {
                continue;
            };
            let swap_lease = build_swap_lease(&run, &group, &spare_slots, &spare_envelope, now);
            self.state.leases.push(swap_lease);
            self.update_pods_after_swap(&run, &group, node_name, &spare_nodes);

            if let Some(run) = self.state.runs.get_mut(&run_key) {
                run.status.phase = RunPhase::Running;
                run.status.message =
                    format!("group {group} swapped to spare after node {node_name} failure");
            }
            info!(run = %run_key, group = %group, node = %node_name, "swapped group to spare");
        }

        if !handled {
            return Err(Error::internal(
                "node-failure",
                format!("no active lease found on node {node_name}"),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Reservation planning
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn plan_reservation(
        &mut self,
        run: &mut Run,
        snapshot: Option<&Snapshot>,
        pack_plan: Option<&pack::Plan>,
        pack_err: Option<&pack::PlanError>,
        cover_err: Option<&cover::PlanError>,
        states: &[BudgetState],
        mut request: cover::Request,
        now: DateTime<Utc>,
    ) -> Result<()> {
        request.quantity =
            run.spec.resources.total_gpus + expected_spare_total(run, pack_plan);

        let forecast = match forecast::plan(forecast::Input {
            run,
            now,
            snapshot,
            pack_plan,
            pack_err,
            cover_err,
            cover_request: &request,
            budget_states: states,
        }) {
            Ok(forecast) => forecast,
            Err(err) => {
                run.status.phase = RunPhase::Pending;
                run.status.message = format!("reservation planning failed: {err}");
                return Ok(());
            }
        };

        let reservation_name = format!("{}-res-{}", run.metadata.name, now.timestamp());
        let countdown = (forecast.earliest_start > now)
            .then(|| (forecast.earliest_start - now).num_seconds());
        let reservation = Reservation {
            metadata: Meta {
                name: reservation_name.clone(),
                namespace: run.metadata.namespace.clone(),
                labels: BTreeMap::new(),
            },
            spec: ReservationSpec {
                run_ref: RunReference {
                    name: run.metadata.name.clone(),
                    namespace: run.metadata.namespace.clone(),
                },
                intended_slice: forecast.intended_slice,
                paying_envelope: forecast.paying_envelope,
                earliest_start: forecast.earliest_start,
            },
            status: ReservationStatus {
                state: ReservationState::Pending,
                reason: forecast.reason,
                countdown_seconds: countdown,
                forecast: Some(forecast.forecast.clone()),
                ..Default::default()
            },
        };

        // A new reservation supersedes any prior ones for the same run.
        let run_name = run.metadata.name.clone();
        let run_namespace = run.metadata.namespace.clone();
        self.state.reservations.retain(|_, existing| {
            existing.spec.run_ref.name != run_name
                || existing.spec.run_ref.namespace != run_namespace
        });
        let key = reservation.key();
        self.state.reservations.insert(key, reservation);

        run.status.phase = RunPhase::Pending;
        run.status.message = format!(
            "reservation {} scheduled for {} (deficit {} GPUs)",
            reservation_name,
            forecast.earliest_start.to_rfc3339(),
            forecast.forecast.deficit_gpus,
        );
        run.status.pending_reservation = Some(reservation_name);
        run.status.earliest_start = Some(forecast.earliest_start);

        let backlog = (forecast.earliest_start - now).num_milliseconds() as f64 / 1000.0;
        metrics::set_reservation_backlog(&run.spec.resources.gpu_type, backlog.max(0.0));
        Ok(())
    }

    fn apply_resolution(&mut self, outcome: &resolver::Outcome, now: DateTime<Utc>) {
        if outcome.actions.is_empty() {
            return;
        }
        let mut closed_groups: BTreeSet<(String, String)> = BTreeSet::new();
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for action in &outcome.actions {
            let Some(lease) = self.state.lease_mut(&action.lease) else {
                continue;
            };
            if lease.status.closed {
                continue;
            }
            lease.close(&action.reason, now);
            affected.insert(action.run.clone());
            closed_groups.insert((action.run.clone(), action.group_index.clone()));
        }

        if !closed_groups.is_empty() {
            self.state.pods.retain(|pod| {
                let run_name = pod.labels.get(LABEL_RUN_NAME).cloned().unwrap_or_default();
                let group = pod
                    .labels
                    .get(LABEL_GROUP_INDEX)
                    .cloned()
                    .unwrap_or_default();
                let key = (namespaced_key(&pod.namespace, &run_name), group);
                !closed_groups.contains(&key)
            });
        }

        let updates: Vec<(String, u32, WidthStatus)> = affected
            .iter()
            .filter_map(|run_key| {
                self.state.runs.get(run_key).map(|run| {
                    (
                        run_key.clone(),
                        active_gpus_for_run(run_key, &self.state.leases),
                        summarize_run_width(run, &self.state.leases),
                    )
                })
            })
            .collect();
        for (run_key, active, width) in updates {
            let Some(run) = self.state.runs.get_mut(&run_key) else {
                continue;
            };
            if active == 0 {
                run.status.phase = RunPhase::Failed;
                run.status.message = "ended by resolver".to_string();
            } else {
                run.status.phase = RunPhase::Running;
                run.status.message = "shrunk by resolver".to_string();
            }
            run.status.width = Some(width);
        }
    }

    // =========================================================================
    // Elastic width
    // =========================================================================

    fn reconcile_elastic(
        &mut self,
        run: &mut Run,
        snapshot: &Snapshot,
        states: &[BudgetState],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(malleable) = run.spec.malleable.clone() else {
            return Ok(());
        };
        let mut width = summarize_run_width(run, &self.state.leases);
        width.pending = String::new();
        let desired = width.desired;
        let allocated = width.allocated;
        run.status.width = Some(width.clone());

        if desired > allocated {
            let grow_by = (desired - allocated).min(malleable.step_gpus);
            if grow_by == 0 {
                return Ok(());
            }
            if let Err(err) = self.grow_run(run, snapshot, states, now, grow_by) {
                warn!(run = %run.key(), error = %err, "grow attempt deferred");
                width.pending = format!("Grow to {desired}");
                run.status.width = Some(width);
                run.status.message = format!("waiting to grow: {err}");
                return Ok(());
            }
            let mut new_width = summarize_run_width(run, &self.state.leases);
            if new_width.allocated < desired {
                new_width.pending = format!("Grow to {desired}");
            }
            run.status.message = format!("grew to {} GPUs", new_width.allocated);
            run.status.width = Some(new_width);
            run.status.funding = Some(summarize_run_funding(run, &self.state, now));
            return Ok(());
        }

        if desired < allocated {
            if let Err(err) = self.shrink_run(run, desired, now) {
                warn!(run = %run.key(), error = %err, "shrink attempt deferred");
                width.pending = format!("Shrink to {desired}");
                run.status.width = Some(width);
                run.status.message = format!("unable to shrink: {err}");
                return Ok(());
            }
            let mut new_width = summarize_run_width(run, &self.state.leases);
            if new_width.allocated > desired {
                new_width.pending = format!("Shrink to {desired}");
            }
            run.status.message = format!("shrunk to {} GPUs", new_width.allocated);
            run.status.width = Some(new_width);
            run.status.funding = Some(summarize_run_funding(run, &self.state, now));
        }

        Ok(())
    }

    fn grow_run(
        &mut self,
        run: &Run,
        snapshot: &Snapshot,
        states: &[BudgetState],
        now: DateTime<Utc>,
        add: u32,
    ) -> Result<()> {
        let plan = pack::plan(
            snapshot,
            &pack::Request {
                flavor: run.spec.resources.gpu_type.clone(),
                total_gpus: add,
                group_gpus: run.group_gpus(),
                allow_cross_group_spread: run.allow_cross_group_spread(),
                spares_per_group: run.spares_per_group(),
            },
        )?;

        let mut request = base_cover_request(run, derive_location(&plan), now);
        request.quantity = add + plan.total_spares;
        let inventory = cover::Inventory::new(states);
        let cover_plan = inventory.plan(&request)?;

        let offset = max_group_index_for_run(&run.key(), &self.state.leases)
            .map(|max| max + 1)
            .unwrap_or(0);
        let bound = binder::materialize(binder::Request {
            run,
            pack_plan: &plan,
            cover_plan: &cover_plan,
            now,
            group_index_offset: offset,
            lease_reason: "Grow",
        })?;
        self.state.pods.extend(bound.pods);
        self.state.leases.extend(bound.leases);
        info!(run = %run.key(), added = add, offset, "grew elastic run");
        Ok(())
    }

    /// Shrinks by closing whole groups, preferring higher borrowed share
    /// and then higher group index, never dropping below `target`.
    fn shrink_run(&mut self, run: &Run, target: u32, now: DateTime<Utc>) -> Result<()> {
        let run_key = run.key();
        let groups = collect_elastic_groups(&run_key, &self.state.leases);
        let current: u32 = groups.values().map(|g| g.active_gpus).sum();
        if target >= current {
            return Ok(());
        }

        let mut ordered: Vec<&ElasticGroup> =
            groups.values().filter(|g| g.active_gpus > 0).collect();
        if ordered.is_empty() {
            return Err(Error::internal("shrink", "no active groups to shrink"));
        }
        ordered.sort_by(|a, b| {
            b.borrowed_gpus
                .cmp(&a.borrowed_gpus)
                .then_with(|| b.index.cmp(&a.index))
        });

        let mut freed = 0u32;
        let mut to_close: Vec<usize> = Vec::new();
        let mut removed: BTreeSet<String> = BTreeSet::new();
        for group in ordered {
            if current - freed <= target {
                break;
            }
            if current - freed - group.active_gpus < target {
                continue;
            }
            to_close.extend(group.active.iter().chain(group.spares.iter()).copied());
            freed += group.active_gpus;
            removed.insert(group.index.to_string());
        }

        if current - freed > target {
            return Err(Error::internal(
                "shrink",
                "insufficient groups available to reach target width",
            ));
        }

        for idx in to_close {
            self.state.leases[idx].close("Shrink", now);
        }
        if !removed.is_empty() {
            self.state.pods.retain(|pod| {
                let run_name = pod.labels.get(LABEL_RUN_NAME).cloned().unwrap_or_default();
                let group = pod
                    .labels
                    .get(LABEL_GROUP_INDEX)
                    .cloned()
                    .unwrap_or_default();
                namespaced_key(&pod.namespace, &run_name) != run_key
                    || !removed.contains(&group)
            });
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn budget_states(&self, now: DateTime<Utc>) -> Vec<BudgetState> {
        self.state
            .budgets
            .iter()
            .map(|budget| build_budget_state(budget, &self.state.leases, now))
            .collect()
    }

    fn update_pods_after_swap(
        &mut self,
        run: &Run,
        group: &str,
        failed_node: &str,
        spare_nodes: &BTreeMap<String, u32>,
    ) {
        let run_name = run.metadata.name.clone();
        self.state.pods.retain(|pod| {
            let pod_run = pod.labels.get(LABEL_RUN_NAME).cloned().unwrap_or_default();
            let pod_group = pod
                .labels
                .get(LABEL_GROUP_INDEX)
                .cloned()
                .unwrap_or_default();
            let pod_role = pod.labels.get(LABEL_ROLE).cloned().unwrap_or_default();
            if pod_run == run_name && pod_group == group {
                if pod.node_name == failed_node {
                    return false;
                }
                if spare_nodes.contains_key(&pod.node_name) {
                    return false;
                }
            }
            if spare_nodes.contains_key(&pod.node_name) && pod_role != "Active" {
                return false;
            }
            true
        });
        for (node, count) in spare_nodes {
            self.state.pods.push(PodManifest {
                namespace: run.metadata.namespace.clone(),
                name: format!("{run_name}-g{group}-swap-{node}"),
                node_name: node.clone(),
                gpus: *count,
                labels: BTreeMap::from([
                    (LABEL_RUN_NAME.to_string(), run_name.clone()),
                    (LABEL_GROUP_INDEX.to_string(), group.to_string()),
                    (LABEL_ROLE.to_string(), "Active".to_string()),
                ]),
            });
        }
    }

    fn finish(
        &mut self,
        key: String,
        run: Run,
        flavor: &str,
        started: std::time::Instant,
        result: &str,
    ) -> Result<()> {
        metrics::observe_admission(flavor, result, started.elapsed().as_secs_f64());
        self.state.runs.insert(key, run);
        Ok(())
    }
}

fn reservation_result(run: &Run) -> &'static str {
    if run.status.pending_reservation.is_some() {
        "reserved"
    } else {
        "pending"
    }
}

/// GPUs currently consumed per node across open leases, slot suffixes
/// stripped.
pub fn compute_usage(leases: &[Lease], now: DateTime<Utc>) -> BTreeMap<String, u32> {
    let mut usage = BTreeMap::new();
    for lease in leases {
        if lease.status.closed {
            continue;
        }
        if let Some(end) = lease.spec.interval.end {
            if now >= end {
                continue;
            }
        }
        for node in lease.spec.slice.node_names() {
            *usage.entry(node.to_string()).or_insert(0) += 1;
        }
    }
    usage
}

fn plan_placement(run: &Run, snapshot: &Snapshot) -> std::result::Result<pack::Plan, pack::PlanError> {
    pack::plan(
        snapshot,
        &pack::Request {
            flavor: run.spec.resources.gpu_type.clone(),
            total_gpus: run.spec.resources.total_gpus,
            group_gpus: run.group_gpus(),
            allow_cross_group_spread: run.allow_cross_group_spread(),
            spares_per_group: run.spares_per_group(),
        },
    )
}

fn base_cover_request(
    run: &Run,
    location: BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> cover::Request {
    let funding = run.spec.funding.as_ref();
    cover::Request {
        owner: run.spec.owner.clone(),
        flavor: run.spec.resources.gpu_type.clone(),
        quantity: run.spec.resources.total_gpus,
        location,
        now,
        expected_duration: None,
        allow_borrow: funding.map(|f| f.allow_borrow).unwrap_or(false),
        sponsors: funding.map(|f| f.sponsors.clone()).unwrap_or_default(),
    }
}

fn derive_location(plan: &pack::Plan) -> BTreeMap<String, String> {
    plan.groups
        .first()
        .map(|group| group.domain.as_labels())
        .unwrap_or_default()
}

/// Spares the plan will carry: the plan's own count when available, else
/// the request-derived estimate of spares x group count.
fn expected_spare_total(run: &Run, plan: Option<&pack::Plan>) -> u32 {
    if let Some(plan) = plan {
        return plan.total_spares;
    }
    let spares = run.spares_per_group();
    if spares == 0 {
        return 0;
    }
    let groups = match run.group_gpus() {
        Some(group_size) if group_size > 0 => {
            run.spec.resources.total_gpus.div_ceil(group_size)
        }
        _ => 1,
    };
    spares * groups
}

fn compute_deficit(snapshot: &Snapshot, scope: &BTreeMap<String, String>, requested: u32) -> u32 {
    let free = free_in_scope(snapshot, scope);
    requested.saturating_sub(free)
}

fn free_in_scope(snapshot: &Snapshot, scope: &BTreeMap<String, String>) -> u32 {
    use crate::topology::{LABEL_CLUSTER, LABEL_FABRIC_DOMAIN, LABEL_REGION};
    if scope.is_empty() {
        return snapshot.total_free_gpus();
    }
    snapshot
        .domains
        .iter()
        .filter(|domain| {
            scope
                .get(LABEL_REGION)
                .map(|v| v == &domain.key.region)
                .unwrap_or(true)
                && scope
                    .get(LABEL_CLUSTER)
                    .map(|v| v == &domain.key.cluster)
                    .unwrap_or(true)
                && scope
                    .get(LABEL_FABRIC_DOMAIN)
                    .map(|v| v == &domain.key.fabric)
                    .unwrap_or(true)
        })
        .map(|domain| domain.free_gpus())
        .sum()
}

/// Active non-spare GPU slots held by a run.
pub fn active_gpus_for_run(run_key: &str, leases: &[Lease]) -> u32 {
    leases
        .iter()
        .filter(|lease| {
            !lease.status.closed
                && lease.spec.slice.role != LeaseRole::Spare
                && lease.spec.run_ref.key() == run_key
        })
        .map(|lease| lease.spec.slice.nodes.len() as u32)
        .sum()
}

/// Width bookkeeping: allocated from open non-spare leases, bounds from the
/// malleable spec (or pinned to totalGPUs for rigid runs).
pub fn summarize_run_width(run: &Run, leases: &[Lease]) -> WidthStatus {
    let allocated = active_gpus_for_run(&run.key(), leases);
    match &run.spec.malleable {
        Some(malleable) => WidthStatus {
            min: malleable.min_total_gpus,
            max: malleable.max_total_gpus,
            desired: malleable
                .desired_total_gpus
                .unwrap_or(malleable.max_total_gpus),
            allocated,
            pending: String::new(),
        },
        None => {
            let total = run.spec.resources.total_gpus;
            WidthStatus {
                min: total,
                max: total,
                desired: total,
                allocated,
                pending: String::new(),
            }
        }
    }
}

/// Funding summary from the run's leases: owned vs borrowed concurrency and
/// accrued GPU-hours, with per-sponsor shares resolved through the envelope
/// owner.
fn summarize_run_funding(run: &Run, state: &ClusterState, now: DateTime<Utc>) -> RunFundingStatus {
    let run_key = run.key();
    let mut status = RunFundingStatus::default();
    let mut sponsors: BTreeMap<String, SponsorShare> = BTreeMap::new();

    for lease in &state.leases {
        if lease.spec.run_ref.key() != run_key {
            continue;
        }
        let usage = compute_lease_usage(lease, now);
        match lease.spec.slice.role {
            LeaseRole::Active => {
                status.owned_gpus += usage.concurrency;
                status.owned_gpu_hours += usage.gpu_hours;
            }
            LeaseRole::Borrowed => {
                status.borrowed_gpus += usage.concurrency;
                status.borrowed_gpu_hours += usage.gpu_hours;
                let sponsor = state
                    .budgets
                    .iter()
                    .find(|budget| {
                        budget.spec.owner != run.spec.owner
                            && budget
                                .spec
                                .envelopes
                                .iter()
                                .any(|env| env.name == lease.spec.paid_by_envelope)
                    })
                    .map(|budget| budget.spec.owner.clone());
                if let Some(owner) = sponsor {
                    let share = sponsors.entry(owner.clone()).or_insert_with(|| {
                        SponsorShare {
                            owner,
                            ..Default::default()
                        }
                    });
                    share.gpus += usage.concurrency;
                    share.gpu_hours += usage.gpu_hours;
                }
            }
            LeaseRole::Spare => {}
        }
    }

    status.sponsors = sponsors.into_values().collect();
    status
}

fn find_spare_lease(leases: &[Lease], run_key: &str, group: &str) -> Option<usize> {
    leases.iter().position(|lease| {
        !lease.status.closed
            && lease.spec.slice.role == LeaseRole::Spare
            && lease.spec.run_ref.key() == run_key
            && lease.metadata.labels.get(LABEL_GROUP_INDEX).map(String::as_str) == Some(group)
    })
}

fn build_swap_lease(
    run: &Run,
    group: &str,
    spare_slots: &[String],
    envelope: &str,
    now: DateTime<Utc>,
) -> Lease {
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
    Lease {
        metadata: Meta {
            name: format!("{}-g{}-swap-{}", run.metadata.name, group, nanos),
            namespace: run.metadata.namespace.clone(),
            labels: BTreeMap::from([
                (LABEL_RUN_NAME.to_string(), run.metadata.name.clone()),
                (LABEL_GROUP_INDEX.to_string(), group.to_string()),
                (LABEL_ROLE.to_string(), "Active".to_string()),
            ]),
        },
        spec: crate::api::LeaseSpec {
            owner: run.spec.owner.clone(),
            run_ref: RunReference {
                name: run.metadata.name.clone(),
                namespace: run.metadata.namespace.clone(),
            },
            slice: crate::api::LeaseSlice {
                nodes: spare_slots.to_vec(),
                role: LeaseRole::Active,
            },
            interval: crate::api::LeaseInterval {
                start: now,
                end: None,
            },
            paid_by_envelope: envelope.to_string(),
            reason: "Swap".to_string(),
        },
        ..Default::default()
    }
}

struct ElasticGroup {
    index: i64,
    active: Vec<usize>,
    spares: Vec<usize>,
    active_gpus: u32,
    borrowed_gpus: u32,
}

fn collect_elastic_groups(run_key: &str, leases: &[Lease]) -> BTreeMap<i64, ElasticGroup> {
    let mut groups: BTreeMap<i64, ElasticGroup> = BTreeMap::new();
    for (idx, lease) in leases.iter().enumerate() {
        if lease.status.closed || lease.spec.run_ref.key() != run_key {
            continue;
        }
        let index: i64 = lease
            .metadata
            .labels
            .get(LABEL_GROUP_INDEX)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let group = groups.entry(index).or_insert_with(|| ElasticGroup {
            index,
            active: Vec::new(),
            spares: Vec::new(),
            active_gpus: 0,
            borrowed_gpus: 0,
        });
        if lease.spec.slice.role == LeaseRole::Spare {
            group.spares.push(idx);
            continue;
        }
        group.active.push(idx);
        let slots = lease.spec.slice.nodes.len() as u32;
        group.active_gpus += slots;
        if lease.spec.slice.role == LeaseRole::Borrowed {
            group.borrowed_gpus += slots;
        }
    }
    groups
}

fn max_group_index_for_run(run_key: &str, leases: &[Lease]) -> Option<u32> {
    leases
        .iter()
        .filter(|lease| !lease.status.closed && lease.spec.run_ref.key() == run_key)
        .filter_map(|lease| {
            lease
                .metadata
                .labels
                .get(LABEL_GROUP_INDEX)
                .and_then(|v| v.parse::<u32>().ok())
        })
        .max()
}
