//! Funding planner
//!
//! Segments a GPU request across budget envelopes. Envelopes are searched in
//! a fixed phase ladder over the family graph - self, siblings, parents in
//! the requested location, then the same owners elsewhere, then cousins,
//! then sponsors - with ascending-name envelope order inside each owner.
//! Allocation respects admission windows, aggregate caps, and lending ACLs;
//! pending allocations made earlier in the same plan reduce what later
//! envelopes sharing a cap may take.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::accounting::{
    aggregate_headroom, envelope_headroom, BudgetState, EnvelopeState, Usage,
};
use crate::api::selector_matches;

/// Why funding planning failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The request itself is malformed
    InvalidRequest,
    /// No envelope ever matched flavor, location, and window
    NoMatchingEnvelope,
    /// Envelopes matched but their headroom ran out
    InsufficientCapacity,
    /// Borrowing was required but the request or policy forbids it
    AclDenied,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "InvalidRequest"),
            Self::NoMatchingEnvelope => write!(f, "NoMatchingEnvelope"),
            Self::InsufficientCapacity => write!(f, "InsufficientCapacity"),
            Self::AclDenied => write!(f, "ACLDenied"),
        }
    }
}

/// Returned when funding fails; callers switch on `reason`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PlanError {
    /// Failure classification
    pub reason: FailureReason,
    /// Human-readable detail
    pub message: String,
}

impl PlanError {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// A funding request for a run.
#[derive(Clone, Debug, Default)]
pub struct Request {
    /// Requesting owner
    pub owner: String,
    /// GPU flavor to fund
    pub flavor: String,
    /// GPUs to cover (actives plus spares)
    pub quantity: u32,
    /// Topology labels of the intended placement
    pub location: BTreeMap<String, String>,
    /// Current instant for window checks
    pub now: DateTime<Utc>,
    /// Expected runtime; `None` or zero ignores GPU-hour caps
    pub expected_duration: Option<Duration>,
    /// Whether sponsor envelopes may be used
    pub allow_borrow: bool,
    /// Sponsor owners, in preference order
    pub sponsors: Vec<String>,
}

/// A single envelope assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Budget carrying the envelope
    pub budget_name: String,
    /// Envelope name
    pub envelope_name: String,
    /// Envelope owner
    pub owner: String,
    /// GPUs funded by this segment
    pub quantity: u32,
    /// Whether the segment is a loan from a sponsor
    pub borrowed: bool,
}

/// The funding plan across envelopes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    /// Ordered segments; family capacity precedes borrowed capacity
    pub segments: Vec<Segment>,
}

impl Plan {
    /// Total GPUs funded.
    pub fn total(&self) -> u32 {
        self.segments.iter().map(|s| s.quantity).sum()
    }
}

/// Indexes budget states by owner and exposes the family sharing graph.
pub struct Inventory<'a> {
    states: &'a [BudgetState],
    owners: BTreeMap<String, Vec<usize>>,
    graph: FamilyGraph,
}

impl<'a> Inventory<'a> {
    /// Builds an inventory from the budget states of all owners.
    pub fn new(states: &'a [BudgetState]) -> Self {
        let mut owners: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut graph = FamilyGraph::default();
        for (idx, state) in states.iter().enumerate() {
            let owner = state.owner().to_string();
            owners.entry(owner.clone()).or_default().push(idx);
            graph.add_owner(&owner);
            for parent in &state.budget.spec.parents {
                graph.add_edge(parent, &owner);
            }
        }
        Self {
            states,
            owners,
            graph,
        }
    }

    /// Computes a funding assignment respecting family sharing and lending.
    pub fn plan(&self, req: &Request) -> Result<Plan, PlanError> {
        if req.quantity == 0 {
            return Err(PlanError::new(
                FailureReason::InvalidRequest,
                "quantity must be positive",
            ));
        }
        if req.owner.is_empty() || req.flavor.is_empty() {
            return Err(PlanError::new(
                FailureReason::InvalidRequest,
                "owner and flavor must be set",
            ));
        }

        let phases = self.build_phases(req);
        let mut remaining = req.quantity;
        let mut segments = Vec::new();
        let mut tracker = AllocationTracker::new(req.expected_duration);

        for phase in &phases {
            if remaining == 0 {
                break;
            }
            for owner in &phase.owners {
                if remaining == 0 {
                    break;
                }
                let Some(state_indices) = self.owners.get(owner) else {
                    continue;
                };
                for &state_idx in state_indices {
                    let state = &self.states[state_idx];
                    for (env_name, env) in &state.envelopes {
                        if remaining == 0 {
                            break;
                        }
                        if env.spec.flavor != req.flavor {
                            continue;
                        }
                        let same_location = selector_matches(&env.spec.selector, &req.location);
                        if phase.require_same && !same_location {
                            continue;
                        }
                        if phase.require_other && same_location {
                            continue;
                        }
                        if !env.spec.allows_admission(req.now) {
                            continue;
                        }
                        if phase.sponsor {
                            if !req.allow_borrow {
                                return Err(PlanError::new(
                                    FailureReason::AclDenied,
                                    "borrowing not allowed",
                                ));
                            }
                            match &env.spec.lending {
                                Some(policy) if policy.allows_borrower(&req.owner) => {}
                                _ => continue,
                            }
                        }

                        let mut available =
                            self.headroom_for_envelope(state_idx, env, &tracker, phase.sponsor);
                        if available == 0 {
                            continue;
                        }
                        available = available.min(remaining);
                        tracker.allocate(state_idx, env, available, phase.sponsor);
                        segments.push(Segment {
                            budget_name: state.budget.metadata.name.clone(),
                            envelope_name: env_name.clone(),
                            owner: env.owner.clone(),
                            quantity: available,
                            borrowed: phase.sponsor && env.owner != req.owner,
                        });
                        remaining -= available;
                    }
                }
            }
        }

        if remaining > 0 {
            if !req.allow_borrow && !req.sponsors.is_empty() {
                return Err(PlanError::new(
                    FailureReason::AclDenied,
                    "borrowing not allowed",
                ));
            }
            let reason = if segments.is_empty() {
                FailureReason::NoMatchingEnvelope
            } else {
                FailureReason::InsufficientCapacity
            };
            return Err(PlanError::new(reason, "insufficient capacity for request"));
        }

        Ok(Plan { segments })
    }

    /// How many GPUs the envelope can still fund, intersecting its own
    /// headroom, every containing aggregate cap, and - for sponsor phases -
    /// the lending limits.
    fn headroom_for_envelope(
        &self,
        state_idx: usize,
        env: &EnvelopeState,
        tracker: &AllocationTracker,
        sponsor: bool,
    ) -> u32 {
        let hours_per_gpu = tracker.expected_hours_per_gpu;
        let pending = tracker.pending_envelope(state_idx, &env.spec.name);
        let additional = Usage {
            concurrency: pending,
            gpu_hours: f64::from(pending) * hours_per_gpu,
            ..Default::default()
        };
        let headroom = envelope_headroom(env, additional);
        if headroom.concurrency == 0 {
            return 0;
        }
        let mut limit = headroom.concurrency;
        if hours_per_gpu > 0.0 {
            if let Some(hours) = headroom.gpu_hours {
                limit = limit.min(floor_gpus(hours / hours_per_gpu));
            }
        }

        let state = &self.states[state_idx];
        for cap_name in &env.aggregates {
            let Some(cap) = state.aggregates.get(cap_name) else {
                continue;
            };
            let cap_pending = tracker.pending_aggregate(state_idx, cap_name);
            let cap_additional = Usage {
                concurrency: cap_pending,
                gpu_hours: f64::from(cap_pending) * hours_per_gpu,
                ..Default::default()
            };
            let cap_headroom = aggregate_headroom(cap, cap_additional);
            limit = limit.min(cap_headroom.concurrency);
            if limit == 0 {
                return 0;
            }
            if hours_per_gpu > 0.0 {
                if let Some(hours) = cap_headroom.gpu_hours {
                    limit = limit.min(floor_gpus(hours / hours_per_gpu));
                }
            }
        }

        if sponsor {
            if let Some(policy) = &env.spec.lending {
                if let Some(max) = policy.max_concurrency {
                    let lent = env.usage.borrowed_concurrency
                        + tracker.pending_borrowed(state_idx, &env.spec.name);
                    limit = limit.min(max.saturating_sub(lent));
                }
                if hours_per_gpu > 0.0 {
                    if let Some(max_hours) = policy.max_gpu_hours {
                        let lent_hours = env.usage.borrowed_gpu_hours
                            + tracker.pending_borrowed_hours(state_idx, &env.spec.name);
                        let available = (max_hours as f64 - lent_hours).max(0.0);
                        limit = limit.min(floor_gpus(available / hours_per_gpu));
                    }
                }
            }
        }

        limit
    }

    fn build_phases(&self, req: &Request) -> Vec<Phase> {
        let siblings = self.graph.siblings(&req.owner);
        let parents = self.graph.parents_of(&req.owner);
        let cousins = self.graph.cousins(&req.owner);
        let self_owner = vec![req.owner.clone()];

        let mut phases = vec![
            Phase::same(self_owner.clone()),
            Phase::same(siblings.clone()),
            Phase::same(parents.clone()),
            Phase::other(self_owner),
            Phase::other(siblings),
            Phase::other(parents),
            Phase::same(cousins.clone()),
            Phase::other(cousins),
        ];
        if req.allow_borrow && !req.sponsors.is_empty() {
            let sponsors = dedup_preserving_order(&req.sponsors);
            phases.push(Phase::sponsor_same(sponsors.clone()));
            phases.push(Phase::sponsor_other(sponsors));
        }
        phases
    }
}

fn floor_gpus(value: f64) -> u32 {
    if value <= 0.0 {
        return 0;
    }
    let floored = value.floor();
    if floored >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        floored as u32
    }
}

fn dedup_preserving_order(list: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    list.iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

struct Phase {
    owners: Vec<String>,
    require_same: bool,
    require_other: bool,
    sponsor: bool,
}

impl Phase {
    fn same(owners: Vec<String>) -> Self {
        Self {
            owners,
            require_same: true,
            require_other: false,
            sponsor: false,
        }
    }

    fn other(owners: Vec<String>) -> Self {
        Self {
            owners,
            require_same: false,
            require_other: true,
            sponsor: false,
        }
    }

    fn sponsor_same(owners: Vec<String>) -> Self {
        Self {
            sponsor: true,
            ..Self::same(owners)
        }
    }

    fn sponsor_other(owners: Vec<String>) -> Self {
        Self {
            sponsor: true,
            ..Self::other(owners)
        }
    }
}

/// Tracks allocations made earlier in the same plan so later envelopes see
/// reduced headroom, keyed by budget-state index plus envelope/cap name.
struct AllocationTracker {
    expected_hours_per_gpu: f64,
    envelope: BTreeMap<(usize, String), u32>,
    borrowed: BTreeMap<(usize, String), u32>,
    borrowed_hours: BTreeMap<(usize, String), f64>,
    aggregate: BTreeMap<(usize, String), u32>,
}

impl AllocationTracker {
    fn new(duration: Option<Duration>) -> Self {
        let hours = duration
            .filter(|d| *d > Duration::zero())
            .map(|d| d.num_milliseconds() as f64 / 3_600_000.0)
            .unwrap_or(0.0);
        Self {
            expected_hours_per_gpu: hours,
            envelope: BTreeMap::new(),
            borrowed: BTreeMap::new(),
            borrowed_hours: BTreeMap::new(),
            aggregate: BTreeMap::new(),
        }
    }

    fn pending_envelope(&self, state_idx: usize, name: &str) -> u32 {
        *self
            .envelope
            .get(&(state_idx, name.to_string()))
            .unwrap_or(&0)
    }

    fn pending_aggregate(&self, state_idx: usize, name: &str) -> u32 {
        *self
            .aggregate
            .get(&(state_idx, name.to_string()))
            .unwrap_or(&0)
    }

    fn pending_borrowed(&self, state_idx: usize, name: &str) -> u32 {
        *self
            .borrowed
            .get(&(state_idx, name.to_string()))
            .unwrap_or(&0)
    }

    fn pending_borrowed_hours(&self, state_idx: usize, name: &str) -> f64 {
        *self
            .borrowed_hours
            .get(&(state_idx, name.to_string()))
            .unwrap_or(&0.0)
    }

    fn allocate(&mut self, state_idx: usize, env: &EnvelopeState, qty: u32, sponsor: bool) {
        if qty == 0 {
            return;
        }
        let key = (state_idx, env.spec.name.clone());
        *self.envelope.entry(key.clone()).or_insert(0) += qty;
        for cap in &env.aggregates {
            *self
                .aggregate
                .entry((state_idx, cap.clone()))
                .or_insert(0) += qty;
        }
        if sponsor {
            *self.borrowed.entry(key.clone()).or_insert(0) += qty;
            if self.expected_hours_per_gpu > 0.0 {
                *self.borrowed_hours.entry(key).or_insert(0.0) +=
                    f64::from(qty) * self.expected_hours_per_gpu;
            }
        }
    }
}

/// Parent/child relationships for family sharing. Phases are computed
/// lazily per request; no traversal state persists.
#[derive(Debug, Default)]
struct FamilyGraph {
    parents: BTreeMap<String, BTreeSet<String>>,
    children: BTreeMap<String, BTreeSet<String>>,
}

impl FamilyGraph {
    fn add_owner(&mut self, owner: &str) {
        self.parents.entry(owner.to_string()).or_default();
        self.children.entry(owner.to_string()).or_default();
    }

    fn add_edge(&mut self, parent: &str, child: &str) {
        self.add_owner(parent);
        self.add_owner(child);
        self.children
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        self.parents
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    fn parents_of(&self, owner: &str) -> Vec<String> {
        self.parents
            .get(owner)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Other children of any of the owner's parents.
    fn siblings(&self, owner: &str) -> Vec<String> {
        let mut result = BTreeSet::new();
        if let Some(parents) = self.parents.get(owner) {
            for parent in parents {
                if let Some(children) = self.children.get(parent) {
                    for child in children {
                        if child != owner {
                            result.insert(child.clone());
                        }
                    }
                }
            }
        }
        result.into_iter().collect()
    }

    /// Children of aunts: two generations up, down through the parent's
    /// siblings.
    fn cousins(&self, owner: &str) -> Vec<String> {
        let mut result = BTreeSet::new();
        let Some(parents) = self.parents.get(owner) else {
            return Vec::new();
        };
        for parent in parents {
            let Some(grandparents) = self.parents.get(parent) else {
                continue;
            };
            for grand in grandparents {
                let Some(aunts) = self.children.get(grand) else {
                    continue;
                };
                for aunt in aunts {
                    if aunt == parent {
                        continue;
                    }
                    if let Some(children) = self.children.get(aunt) {
                        result.extend(children.iter().cloned());
                    }
                }
            }
        }
        result.into_iter().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::build_budget_state;
    use crate::api::{
        Budget, BudgetSpec, Envelope, Lease, LeaseInterval, LeaseRole, LeaseSlice, LeaseSpec,
        LendingPolicy, Meta, PreActivationPolicy, RunReference,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn west_selector() -> BTreeMap<String, String> {
        BTreeMap::from([("region".to_string(), "us-west".to_string())])
    }

    fn west_location() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("region".to_string(), "us-west".to_string()),
            ("cluster".to_string(), "cluster-a".to_string()),
            ("fabric.domain".to_string(), "island-a".to_string()),
        ])
    }

    fn budget(name: &str, owner: &str, envelopes: Vec<Envelope>, parents: Vec<&str>) -> Budget {
        Budget {
            metadata: Meta::named(name),
            spec: BudgetSpec {
                owner: owner.to_string(),
                envelopes,
                parents: parents.into_iter().map(String::from).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn envelope(name: &str, concurrency: u32) -> Envelope {
        Envelope {
            name: name.to_string(),
            flavor: "H100-80GB".to_string(),
            selector: west_selector(),
            concurrency,
            ..Default::default()
        }
    }

    fn states(budgets: &[Budget], leases: &[Lease]) -> Vec<BudgetState> {
        budgets
            .iter()
            .map(|b| build_budget_state(b, leases, now()))
            .collect()
    }

    fn request(owner: &str, quantity: u32) -> Request {
        Request {
            owner: owner.to_string(),
            flavor: "H100-80GB".to_string(),
            quantity,
            location: west_location(),
            now: now(),
            ..Default::default()
        }
    }

    fn lease(owner: &str, envelope: &str, slots: u32) -> Lease {
        Lease {
            metadata: Meta::named(format!("{owner}-{envelope}")),
            spec: LeaseSpec {
                owner: owner.to_string(),
                run_ref: RunReference {
                    name: "other".to_string(),
                    namespace: String::new(),
                },
                slice: LeaseSlice {
                    nodes: (0..slots).map(|i| format!("node-z#{i}")).collect(),
                    role: LeaseRole::Active,
                },
                interval: LeaseInterval {
                    start: now() - Duration::hours(1),
                    end: None,
                },
                paid_by_envelope: envelope.to_string(),
                reason: "Start".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn self_capacity_covers_whole_request() {
        let budgets = vec![budget(
            "child-a",
            "org:child-a",
            vec![envelope("west", 8)],
            vec!["org:parent"],
        )];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);
        let plan = inv.plan(&request("org:child-a", 4)).unwrap();
        assert_eq!(plan.segments.len(), 1);
        assert_eq!(plan.segments[0].owner, "org:child-a");
        assert_eq!(plan.total(), 4);
        assert!(!plan.segments[0].borrowed);
    }

    #[test]
    fn sibling_capacity_fills_after_self() {
        // Worked example: sibling A has 2 free, sibling B has 10; child A
        // requests 4 in us-west.
        let budgets = vec![
            budget(
                "child-a",
                "org:child-a",
                vec![envelope("west", 2)],
                vec!["org:parent"],
            ),
            budget(
                "child-b",
                "org:child-b",
                vec![envelope("west", 10)],
                vec!["org:parent"],
            ),
        ];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);
        let plan = inv.plan(&request("org:child-a", 4)).unwrap();
        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.segments[0].owner, "org:child-a");
        assert_eq!(plan.segments[0].quantity, 2);
        assert_eq!(plan.segments[1].owner, "org:child-b");
        assert_eq!(plan.segments[1].quantity, 2);
    }

    #[test]
    fn same_location_preferred_over_other() {
        let mut east = envelope("east", 8);
        east.selector = BTreeMap::from([("region".to_string(), "us-east".to_string())]);
        let budgets = vec![budget(
            "child-a",
            "org:child-a",
            vec![east, envelope("west", 2)],
            vec![],
        )];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);
        let plan = inv.plan(&request("org:child-a", 4)).unwrap();
        // "west" matches the location and comes first despite "east" sorting
        // earlier by name.
        assert_eq!(plan.segments[0].envelope_name, "west");
        assert_eq!(plan.segments[0].quantity, 2);
        assert_eq!(plan.segments[1].envelope_name, "east");
        assert_eq!(plan.segments[1].quantity, 2);
    }

    #[test]
    fn window_closed_envelope_skipped() {
        let mut windowed = envelope("west", 8);
        windowed.start = Some(now() + Duration::hours(2));
        let budgets = vec![budget("child-a", "org:child-a", vec![windowed], vec![])];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);
        let err = inv.plan(&request("org:child-a", 4)).unwrap_err();
        assert_eq!(err.reason, FailureReason::NoMatchingEnvelope);
    }

    #[test]
    fn pre_activation_admission_opens_window() {
        let mut windowed = envelope("west", 8);
        windowed.start = Some(now() + Duration::hours(2));
        windowed.pre_activation = Some(PreActivationPolicy {
            allow_reservations: true,
            allow_admission: true,
        });
        let budgets = vec![budget("child-a", "org:child-a", vec![windowed], vec![])];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);
        assert!(inv.plan(&request("org:child-a", 4)).is_ok());
    }

    #[test]
    fn borrowing_respects_lender_acl_and_cap() {
        // Worked example: lender concurrency 8, lends up to 4 to org:child;
        // child has 2 of its own; request 6.
        let mut lender_env = envelope("pool", 8);
        lender_env.lending = Some(LendingPolicy {
            allow: true,
            to: vec!["org:child".to_string()],
            max_concurrency: Some(4),
            max_gpu_hours: None,
        });
        let budgets = vec![
            budget("child", "org:child", vec![envelope("west", 2)], vec![]),
            budget("lender", "org:lender", vec![lender_env], vec![]),
        ];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);

        let mut req = request("org:child", 6);
        req.allow_borrow = true;
        req.sponsors = vec!["org:lender".to_string()];
        let plan = inv.plan(&req).unwrap();
        assert_eq!(plan.segments.len(), 2);
        let borrowed = &plan.segments[1];
        assert!(borrowed.borrowed);
        assert_eq!(borrowed.quantity, 4);
        assert_eq!(borrowed.owner, "org:lender");

        // A borrower outside the ACL gets nothing from the lender.
        let mut denied = request("org:stranger", 2);
        denied.allow_borrow = true;
        denied.sponsors = vec!["org:lender".to_string()];
        let err = inv.plan(&denied).unwrap_err();
        assert_eq!(err.reason, FailureReason::NoMatchingEnvelope);
    }

    #[test]
    fn no_borrow_flag_yields_acl_denied_when_sponsors_were_the_way() {
        let mut lender_env = envelope("pool", 8);
        lender_env.lending = Some(LendingPolicy {
            allow: true,
            ..Default::default()
        });
        let budgets = vec![
            budget("child", "org:child", vec![envelope("west", 2)], vec![]),
            budget("lender", "org:lender", vec![lender_env], vec![]),
        ];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);

        let mut req = request("org:child", 6);
        req.allow_borrow = false;
        req.sponsors = vec!["org:lender".to_string()];
        let err = inv.plan(&req).unwrap_err();
        assert_eq!(err.reason, FailureReason::AclDenied);
    }

    #[test]
    fn no_borrowed_segments_without_allow_borrow() {
        let budgets = vec![budget(
            "child",
            "org:child",
            vec![envelope("west", 8)],
            vec![],
        )];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);
        let plan = inv.plan(&request("org:child", 4)).unwrap();
        assert!(plan.segments.iter().all(|s| !s.borrowed));
    }

    #[test]
    fn aggregate_cap_limits_shared_envelopes() {
        let mut b = budget(
            "child",
            "org:child",
            vec![envelope("west-a", 6), envelope("west-b", 6)],
            vec![],
        );
        b.spec.aggregate_caps.push(crate::api::AggregateCap {
            name: "regional".to_string(),
            flavor: "H100-80GB".to_string(),
            envelopes: vec!["west-a".to_string(), "west-b".to_string()],
            max_concurrency: Some(8),
            max_gpu_hours: None,
        });
        let st = states(&[b], &[]);
        let inv = Inventory::new(&st);

        // Cap of 8 across both envelopes: the second envelope only gets the
        // remainder after the first's pending allocation.
        let plan = inv.plan(&request("org:child", 8)).unwrap();
        assert_eq!(plan.segments[0].quantity, 6);
        assert_eq!(plan.segments[1].quantity, 2);

        let err = inv.plan(&request("org:child", 9)).unwrap_err();
        assert_eq!(err.reason, FailureReason::InsufficientCapacity);
    }

    #[test]
    fn gpu_hour_caps_bound_quantity_when_duration_known() {
        let mut env = envelope("west", 8);
        env.max_gpu_hours = Some(12);
        let budgets = vec![budget("child", "org:child", vec![env], vec![])];
        let st = states(&budgets, &[]);
        let inv = Inventory::new(&st);

        // 12 GPU-hours over a 4h run funds at most 3 GPUs.
        let mut req = request("org:child", 4);
        req.expected_duration = Some(Duration::hours(4));
        let err = inv.plan(&req).unwrap_err();
        assert_eq!(err.reason, FailureReason::InsufficientCapacity);

        req.quantity = 3;
        assert!(inv.plan(&req).is_ok());

        // Zero duration ignores the hour cap entirely.
        let mut untimed = request("org:child", 4);
        untimed.expected_duration = None;
        assert!(inv.plan(&untimed).is_ok());
    }

    #[test]
    fn existing_usage_reduces_headroom() {
        let budgets = vec![budget(
            "child",
            "org:child",
            vec![envelope("west", 8)],
            vec![],
        )];
        let leases = vec![lease("org:child", "west", 6)];
        let st = states(&budgets, &leases);
        let inv = Inventory::new(&st);
        let plan = inv.plan(&request("org:child", 2)).unwrap();
        assert_eq!(plan.total(), 2);
        let err = inv.plan(&request("org:child", 3)).unwrap_err();
        assert_eq!(err.reason, FailureReason::InsufficientCapacity);
    }

    #[test]
    fn family_graph_relations() {
        let mut graph = FamilyGraph::default();
        graph.add_edge("org", "org:a");
        graph.add_edge("org", "org:b");
        graph.add_edge("org:a", "org:a:x");
        graph.add_edge("org:a", "org:a:y");
        graph.add_edge("org:b", "org:b:z");

        assert_eq!(graph.parents_of("org:a:x"), vec!["org:a"]);
        assert_eq!(graph.siblings("org:a:x"), vec!["org:a:y"]);
        assert_eq!(graph.cousins("org:a:x"), vec!["org:b:z"]);
        assert!(graph.cousins("org").is_empty());
    }
}
