//! End-to-end admission scenarios driven through the RunController.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};

use jobtree::api::{
    Budget, BudgetSpec, Envelope, LeaseRole, LendingPolicy, Meta, PreActivationPolicy,
    ReservationState, Run, RunFunding, RunLocality, RunMalleability, RunPhase, RunResources,
    RunSpec,
};
use jobtree::clock::FixedClock;
use jobtree::controller::{ClusterState, RunController};
use jobtree::topology::{
    SourceNode, LABEL_CLUSTER, LABEL_FABRIC_DOMAIN, LABEL_GPU_FLAVOR, LABEL_RACK, LABEL_REGION,
};

const FLAVOR: &str = "H100-80GB";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn node(name: &str, fabric: &str, gpus: u32) -> SourceNode {
    SourceNode {
        name: name.to_string(),
        labels: BTreeMap::from([
            (LABEL_GPU_FLAVOR.to_string(), FLAVOR.to_string()),
            (LABEL_REGION.to_string(), "us-west".to_string()),
            (LABEL_CLUSTER.to_string(), "cluster-a".to_string()),
            (LABEL_FABRIC_DOMAIN.to_string(), fabric.to_string()),
            (LABEL_RACK.to_string(), "rack-1".to_string()),
        ]),
        gpus,
    }
}

fn envelope(name: &str, concurrency: u32) -> Envelope {
    Envelope {
        name: name.to_string(),
        flavor: FLAVOR.to_string(),
        selector: BTreeMap::from([(LABEL_REGION.to_string(), "us-west".to_string())]),
        concurrency,
        ..Default::default()
    }
}

fn budget(name: &str, owner: &str, envelopes: Vec<Envelope>) -> Budget {
    Budget {
        metadata: Meta::named(name),
        spec: BudgetSpec {
            owner: owner.to_string(),
            envelopes,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn simple_run(name: &str, owner: &str, gpus: u32) -> Run {
    let mut run = Run {
        metadata: Meta::named(name),
        spec: RunSpec {
            owner: owner.to_string(),
            resources: RunResources {
                gpu_type: FLAVOR.to_string(),
                total_gpus: gpus,
            },
            ..Default::default()
        },
        ..Default::default()
    };
    run.default_fields();
    run
}

fn controller(state: ClusterState, now: DateTime<Utc>) -> RunController<FixedClock> {
    RunController::with_clock(state, FixedClock(now))
}

#[test]
fn simple_admission_binds_pod_and_lease() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 8)]));
    state.upsert_run(simple_run("train", "org:team", 4));

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();

    let state = ctrl.state();
    let run = &state.runs["default/train"];
    assert_eq!(run.status.phase, RunPhase::Running);
    assert_eq!(run.status.message, "bound 4 GPUs");
    assert_eq!(run.status.width.as_ref().unwrap().allocated, 4);

    assert_eq!(state.pods.len(), 1);
    assert_eq!(state.pods[0].node_name, "node-a");
    assert_eq!(state.pods[0].gpus, 4);

    assert_eq!(state.leases.len(), 1);
    let lease = &state.leases[0];
    assert_eq!(lease.spec.paid_by_envelope, "west");
    assert_eq!(lease.spec.slice.role, LeaseRole::Active);
    assert_eq!(lease.spec.slice.nodes.len(), 4);

    let funding = run.status.funding.as_ref().unwrap();
    assert_eq!(funding.owned_gpus, 4);
    assert_eq!(funding.borrowed_gpus, 0);
}

#[test]
fn reconciling_a_steady_run_is_a_no_op() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 8)]));
    state.upsert_run(simple_run("train", "org:team", 4));

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();
    let (leases, pods) = (ctrl.state().leases.len(), ctrl.state().pods.len());

    ctrl.reconcile("", "train").unwrap();
    assert_eq!(ctrl.state().leases.len(), leases);
    assert_eq!(ctrl.state().pods.len(), pods);
}

#[test]
fn capacity_shortage_creates_reservation() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 16)]));
    state.upsert_run(simple_run("train", "org:team", 8));

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();

    let state = ctrl.state();
    let run = &state.runs["default/train"];
    assert_eq!(run.status.phase, RunPhase::Pending);
    assert!(run.status.pending_reservation.is_some());
    assert!(run.status.earliest_start.unwrap() > t0());

    assert_eq!(state.reservations.len(), 1);
    let reservation = state.reservations.values().next().unwrap();
    assert_eq!(reservation.status.state, ReservationState::Pending);
    let forecast = reservation.status.forecast.as_ref().unwrap();
    assert_eq!(forecast.deficit_gpus, 4);
    assert_eq!(forecast.remedies.len(), 3);
    assert!(reservation.status.countdown_seconds.unwrap() > 0);
    assert!(state.leases.is_empty());
}

#[test]
fn repeated_reconciles_keep_one_pending_reservation() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 16)]));
    state.upsert_run(simple_run("train", "org:team", 8));

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();
    ctrl.reconcile("", "train").unwrap();
    assert_eq!(ctrl.state().reservations.len(), 1);

    // A later reconcile under a new name still supersedes the old one.
    let state = ctrl.into_state();
    let mut ctrl = controller(state, t0() + Duration::minutes(5));
    ctrl.reconcile("", "train").unwrap();
    assert_eq!(ctrl.state().reservations.len(), 1);
    let reservation = ctrl.state().reservations.values().next().unwrap();
    assert_eq!(reservation.status.state, ReservationState::Pending);
}

#[test]
fn future_window_reservation_is_window_aligned() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 8));
    let mut windowed = envelope("west", 16);
    windowed.start = Some(t0() + Duration::hours(2));
    windowed.pre_activation = Some(PreActivationPolicy {
        allow_reservations: true,
        allow_admission: false,
    });
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![windowed]));
    state.upsert_run(simple_run("train", "org:team", 8));

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();

    let state = ctrl.state();
    let run = &state.runs["default/train"];
    assert_eq!(run.status.phase, RunPhase::Pending);

    let reservation = state.reservations.values().next().unwrap();
    let forecast = reservation.status.forecast.as_ref().unwrap();
    assert_eq!(forecast.confidence, "window-aligned");
    assert!(
        reservation.spec.earliest_start
            >= t0() + Duration::hours(2) + Duration::seconds(10)
    );
}

#[test]
fn family_capacity_funds_across_siblings() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 8));
    let mut child_a = budget("child-a", "org:child-a", vec![envelope("west", 2)]);
    child_a.spec.parents = vec!["org:parent".to_string()];
    let mut child_b = budget("child-b", "org:child-b", vec![envelope("west", 10)]);
    child_b.spec.parents = vec!["org:parent".to_string()];
    state.budgets.push(child_a);
    state.budgets.push(child_b);
    state.upsert_run(simple_run("train", "org:child-a", 4));

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();

    let state = ctrl.state();
    assert_eq!(state.runs["default/train"].status.phase, RunPhase::Running);
    assert_eq!(state.leases.len(), 2);
    // Own capacity first, the sibling's envelope for the remainder.
    assert_eq!(state.leases[0].spec.slice.nodes.len(), 2);
    assert_eq!(state.leases[1].spec.slice.nodes.len(), 2);
    assert!(state
        .leases
        .iter()
        .all(|l| l.spec.slice.role == LeaseRole::Active));
}

#[test]
fn borrowing_produces_borrowed_lease_capped_by_lender() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 8));
    let mut lender_env = envelope("pool", 8);
    lender_env.lending = Some(LendingPolicy {
        allow: true,
        to: vec!["org:child".to_string()],
        max_concurrency: Some(4),
        max_gpu_hours: None,
    });
    state
        .budgets
        .push(budget("child", "org:child", vec![envelope("west", 2)]));
    state
        .budgets
        .push(budget("lender", "org:lender", vec![lender_env]));

    let mut run = simple_run("train", "org:child", 6);
    run.spec.funding = Some(RunFunding {
        allow_borrow: true,
        max_borrow_gpus: None,
        sponsors: vec!["org:lender".to_string()],
    });
    state.upsert_run(run);

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();

    let state = ctrl.state();
    assert_eq!(state.runs["default/train"].status.phase, RunPhase::Running);
    let borrowed: Vec<_> = state
        .leases
        .iter()
        .filter(|l| l.spec.slice.role == LeaseRole::Borrowed)
        .collect();
    assert_eq!(borrowed.len(), 1);
    assert_eq!(borrowed[0].spec.slice.nodes.len(), 4);
    assert_eq!(borrowed[0].spec.paid_by_envelope, "pool");

    let funding = state.runs["default/train"]
        .status
        .funding
        .as_ref()
        .unwrap();
    assert_eq!(funding.owned_gpus, 2);
    assert_eq!(funding.borrowed_gpus, 4);
    assert_eq!(funding.sponsors.len(), 1);
    assert_eq!(funding.sponsors[0].owner, "org:lender");
    assert_eq!(funding.sponsors[0].gpus, 4);
}

#[test]
fn activation_resolves_deficit_with_deterministic_lottery() {
    fn build() -> ClusterState {
        let mut state = ClusterState::default();
        state.nodes.push(node("node-a", "island-a", 8));
        state.nodes.push(node("node-b", "island-a", 8));
        state
            .budgets
            .push(budget("budget-a", "org:a", vec![envelope("west", 8)]));
        state
            .budgets
            .push(budget("budget-b", "org:b", vec![envelope("west", 8)]));
        state
            .budgets
            .push(budget("budget-c", "org:c", vec![envelope("west", 8)]));
        state.upsert_run(simple_run("run-a", "org:a", 8));
        state.upsert_run(simple_run("run-b", "org:b", 8));
        state.upsert_run(simple_run("run-c", "org:c", 8));
        state
    }

    fn drive(state: ClusterState) -> ClusterState {
        let mut ctrl = controller(state, t0());
        ctrl.reconcile("", "run-a").unwrap();
        ctrl.reconcile("", "run-b").unwrap();
        // The cluster is now full; run-c gets a reservation.
        ctrl.reconcile("", "run-c").unwrap();
        assert_eq!(
            ctrl.state().runs["default/run-c"].status.phase,
            RunPhase::Pending
        );
        assert_eq!(ctrl.state().reservations.len(), 1);

        let state = ctrl.into_state();
        let activation_time = t0() + Duration::minutes(30);
        let mut ctrl = controller(state, activation_time);
        ctrl.activate_reservations(activation_time).unwrap();
        ctrl.into_state()
    }

    let first = drive(build());
    let second = drive(build());

    // The reservation released and run-c is running.
    let reservation = first.reservations.values().next().unwrap();
    assert_eq!(reservation.status.state, ReservationState::Released);
    assert!(reservation.status.released_at.is_some());
    assert_eq!(first.runs["default/run-c"].status.phase, RunPhase::Running);

    // Exactly one of the two incumbents lost the lottery.
    let failed: Vec<&str> = ["default/run-a", "default/run-b"]
        .iter()
        .filter(|key| first.runs[**key].status.phase == RunPhase::Failed)
        .copied()
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(first.runs[failed[0]].status.message, "ended by resolver");

    let preempted: Vec<_> = first
        .leases
        .iter()
        .filter(|l| l.status.closed)
        .collect();
    assert_eq!(preempted.len(), 1);
    assert!(preempted[0]
        .status
        .closure_reason
        .starts_with("RandomPreempt(0x"));

    // Identical inputs and instants preempt the identical victim.
    let failed_again: Vec<&str> = ["default/run-a", "default/run-b"]
        .iter()
        .filter(|key| second.runs[**key].status.phase == RunPhase::Failed)
        .copied()
        .collect();
    assert_eq!(failed, failed_again);
}

#[test]
fn activation_sweep_without_pending_reservations_is_a_no_op() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    let before = state.clone();

    let mut ctrl = controller(state, t0());
    ctrl.activate_reservations(t0()).unwrap();
    assert_eq!(ctrl.state().leases.len(), before.leases.len());
    assert_eq!(ctrl.state().reservations.len(), before.reservations.len());
}

#[test]
fn elastic_run_grows_by_step_and_shrinks_whole_groups() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 16));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 32)]));

    let mut run = simple_run("elastic", "org:team", 8);
    run.spec.malleable = Some(RunMalleability {
        min_total_gpus: 4,
        max_total_gpus: 16,
        step_gpus: 4,
        desired_total_gpus: Some(8),
    });
    run.default_fields();
    state.upsert_run(run);

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "elastic").unwrap();
    assert_eq!(
        ctrl.state().runs["default/elastic"]
            .status
            .width
            .as_ref()
            .unwrap()
            .allocated,
        8
    );

    // Raise desired: the next reconcile grows by one step.
    ctrl.state_mut()
        .runs
        .get_mut("default/elastic")
        .unwrap()
        .spec
        .malleable
        .as_mut()
        .unwrap()
        .desired_total_gpus = Some(12);
    let state = ctrl.into_state();
    let mut ctrl = controller(state, t0() + Duration::minutes(1));
    ctrl.reconcile("", "elastic").unwrap();

    let width = ctrl.state().runs["default/elastic"]
        .status
        .width
        .clone()
        .unwrap();
    assert_eq!(width.allocated, 12);
    assert!(width.pending.is_empty());
    assert_eq!(
        ctrl.state().runs["default/elastic"].status.message,
        "grew to 12 GPUs"
    );

    // Lower desired back: the grown group is closed wholesale.
    ctrl.state_mut()
        .runs
        .get_mut("default/elastic")
        .unwrap()
        .spec
        .malleable
        .as_mut()
        .unwrap()
        .desired_total_gpus = Some(8);
    let state = ctrl.into_state();
    let mut ctrl = controller(state, t0() + Duration::minutes(2));
    ctrl.reconcile("", "elastic").unwrap();

    let state = ctrl.state();
    let width = state.runs["default/elastic"].status.width.as_ref().unwrap();
    assert_eq!(width.allocated, 8);
    let shrunk: Vec<_> = state
        .leases
        .iter()
        .filter(|l| l.status.closed)
        .collect();
    assert!(!shrunk.is_empty());
    assert!(shrunk.iter().all(|l| l.status.closure_reason == "Shrink"));
}

#[test]
fn blocked_growth_records_pending_marker() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 8));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 32)]));

    let mut run = simple_run("elastic", "org:team", 8);
    run.spec.malleable = Some(RunMalleability {
        min_total_gpus: 4,
        max_total_gpus: 16,
        step_gpus: 4,
        desired_total_gpus: Some(8),
    });
    run.default_fields();
    state.upsert_run(run);

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "elastic").unwrap();

    ctrl.state_mut()
        .runs
        .get_mut("default/elastic")
        .unwrap()
        .spec
        .malleable
        .as_mut()
        .unwrap()
        .desired_total_gpus = Some(12);
    let state = ctrl.into_state();
    let mut ctrl = controller(state, t0() + Duration::minutes(1));
    ctrl.reconcile("", "elastic").unwrap();

    let run = &ctrl.state().runs["default/elastic"];
    assert_eq!(run.status.phase, RunPhase::Running);
    let width = run.status.width.as_ref().unwrap();
    assert_eq!(width.allocated, 8);
    assert_eq!(width.pending, "Grow to 12");
    assert!(run.status.message.starts_with("waiting to grow"));
}

#[test]
fn node_failure_swaps_group_onto_spare() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    state.nodes.push(node("node-b", "island-a", 4));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 8)]));

    let mut run = simple_run("train", "org:team", 4);
    run.spec.spares_per_group = Some(1);
    state.upsert_run(run);

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();
    assert_eq!(
        ctrl.state()
            .leases
            .iter()
            .filter(|l| l.spec.slice.role == LeaseRole::Spare)
            .count(),
        1
    );

    let failure_time = t0() + Duration::hours(1);
    ctrl.handle_node_failure("node-a", failure_time).unwrap();

    let state = ctrl.state();
    let run = &state.runs["default/train"];
    assert_eq!(run.status.phase, RunPhase::Running);
    assert!(run.status.message.contains("swapped to spare"));

    let reasons: BTreeMap<String, usize> = state
        .leases
        .iter()
        .filter(|l| l.status.closed)
        .fold(BTreeMap::new(), |mut acc, l| {
            *acc.entry(l.status.closure_reason.clone()).or_insert(0) += 1;
            acc
        });
    assert_eq!(reasons.get("NodeFailure"), Some(&1));
    assert_eq!(reasons.get("Swap"), Some(&1));

    let replacement: Vec<_> = state
        .leases
        .iter()
        .filter(|l| !l.status.closed && l.spec.reason == "Swap")
        .collect();
    assert_eq!(replacement.len(), 1);
    assert_eq!(replacement[0].spec.slice.role, LeaseRole::Active);
    assert!(replacement[0].spec.slice.nodes[0].starts_with("node-b"));
}

#[test]
fn node_failure_without_spare_fails_the_run() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 8)]));
    state.upsert_run(simple_run("train", "org:team", 4));

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "train").unwrap();
    ctrl.handle_node_failure("node-a", t0() + Duration::hours(1))
        .unwrap();

    let run = &ctrl.state().runs["default/train"];
    assert_eq!(run.status.phase, RunPhase::Failed);
    assert!(run.status.message.contains("without spare coverage"));
}

#[test]
fn node_failure_on_untouched_node_is_an_error() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    let mut ctrl = controller(state, t0());
    assert!(ctrl.handle_node_failure("node-zzz", t0()).is_err());
}

#[test]
fn grouped_run_places_groups_with_spread() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    state.nodes.push(node("node-b", "island-b", 4));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 16)]));

    let mut run = simple_run("sharded", "org:team", 8);
    run.spec.locality = Some(RunLocality {
        group_gpus: Some(4),
        allow_cross_group_spread: Some(true),
    });
    state.upsert_run(run);

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "sharded").unwrap();

    let state = ctrl.state();
    assert_eq!(state.runs["default/sharded"].status.phase, RunPhase::Running);
    let nodes: Vec<&str> = state
        .pods
        .iter()
        .map(|p| p.node_name.as_str())
        .collect();
    assert!(nodes.contains(&"node-a"));
    assert!(nodes.contains(&"node-b"));
}

#[test]
fn single_domain_requirement_blocks_spread() {
    let mut state = ClusterState::default();
    state.nodes.push(node("node-a", "island-a", 4));
    state.nodes.push(node("node-b", "island-b", 4));
    state
        .budgets
        .push(budget("team-budget", "org:team", vec![envelope("west", 16)]));

    let mut run = simple_run("tight", "org:team", 8);
    run.spec.locality = Some(RunLocality {
        group_gpus: None,
        allow_cross_group_spread: Some(false),
    });
    state.upsert_run(run);

    let mut ctrl = controller(state, t0());
    ctrl.reconcile("", "tight").unwrap();

    let run = &ctrl.state().runs["default/tight"];
    assert_eq!(run.status.phase, RunPhase::Pending);
    // No single island fits 8 GPUs, so the run waits behind a reservation.
    assert!(run.status.pending_reservation.is_some());
}
