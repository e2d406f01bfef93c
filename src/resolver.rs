//! Deficit resolver
//!
//! Runs at reservation activation when capacity is still short. Three
//! ordered phases free GPUs within a scope: drop spare slices, shrink
//! malleable runs group by group, then a deterministic lottery over the
//! remaining groups. The lottery seed is derived from the reservation name
//! and the activation instant, so identical inputs replay bit-for-bit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::api::{Lease, LeaseRole, Run};
use crate::binder::LABEL_GROUP_INDEX;
use crate::metrics;
use crate::topology::SourceNode;

/// Classifies resolver outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// A spare lease was reclaimed
    DropSpare,
    /// A malleable group was shrunk deterministically
    Shrink,
    /// A group was ended by the lottery
    Lottery,
}

impl ActionKind {
    /// Metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DropSpare => "DropSpare",
            Self::Shrink => "Shrink",
            Self::Lottery => "Lottery",
        }
    }
}

/// Errors from deficit resolution; the reservation stays Pending.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Flavor was not provided
    #[error("flavor must be provided")]
    MissingFlavor,
    /// Nothing in scope to preempt
    #[error("no candidates available for lottery")]
    NoCandidates,
    /// All tokens were consumed before the deficit cleared
    #[error("lottery exhausted before clearing deficit")]
    LotteryExhausted,
}

/// Context for resolving an oversubscription.
pub struct Input<'a> {
    /// GPUs to free
    pub deficit: u32,
    /// GPU flavor in contention
    pub flavor: String,
    /// Labels bounding which leases are eligible; empty means everything
    pub scope: BTreeMap<String, String>,
    /// Seed source, typically the activating reservation's name
    pub seed_source: String,
    /// Activation instant
    pub now: DateTime<Utc>,
    /// Node inventory, for scope label lookups
    pub nodes: &'a [SourceNode],
    /// Open leases to consider
    pub leases: &'a [Lease],
    /// Runs indexed by `namespace/name`
    pub runs: &'a BTreeMap<String, Run>,
}

/// A lease that should be ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    /// Which phase produced the action
    pub kind: ActionKind,
    /// `namespace/name` key of the lease to close
    pub lease: String,
    /// `namespace/name` key of the owning run
    pub run: String,
    /// Group index label value of the lease
    pub group_index: String,
    /// GPU slots freed
    pub gpus: u32,
    /// Closure reason to record on the lease
    pub reason: String,
}

/// Resolver outcome.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outcome {
    /// Leases to close, in application order
    pub actions: Vec<Action>,
    /// Lottery seed; empty when the structural phases sufficed
    pub seed: String,
}

struct Candidate {
    lease_key: String,
    lease_name: String,
    run_key: String,
    owner: String,
    role: LeaseRole,
    group_index: String,
    gpus: u32,
    marked: bool,
}

struct Group {
    run_key: String,
    index: String,
    candidates: Vec<usize>,
    gpus: u32,
    marked: bool,
}

struct RunState {
    owner: String,
    min_width: Option<u32>,
    remaining: u32,
}

/// Executes structural cuts followed by a lottery to clear the deficit.
pub fn resolve(input: Input<'_>) -> Result<Outcome, ResolveError> {
    if input.deficit == 0 {
        return Ok(Outcome::default());
    }
    if input.flavor.is_empty() {
        return Err(ResolveError::MissingFlavor);
    }

    let node_labels: BTreeMap<&str, &BTreeMap<String, String>> = input
        .nodes
        .iter()
        .map(|n| (n.name.as_str(), &n.labels))
        .collect();

    let (mut candidates, mut groups, mut run_states) = gather_candidates(&input, &node_labels);
    let mut deficit = i64::from(input.deficit);
    let mut actions = Vec::new();

    // 1. Drop spares, ordered by (run owner, lease name).
    let mut spare_order: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].role == LeaseRole::Spare)
        .collect();
    spare_order.sort_by(|&a, &b| {
        candidates[a]
            .owner
            .cmp(&candidates[b].owner)
            .then_with(|| candidates[a].lease_name.cmp(&candidates[b].lease_name))
    });
    for idx in spare_order {
        if deficit <= 0 {
            break;
        }
        let cand = &mut candidates[idx];
        cand.marked = true;
        deficit -= i64::from(cand.gpus);
        actions.push(Action {
            kind: ActionKind::DropSpare,
            lease: cand.lease_key.clone(),
            run: cand.run_key.clone(),
            group_index: cand.group_index.clone(),
            gpus: cand.gpus,
            reason: "DropSpare".to_string(),
        });
        metrics::inc_resolver_action(ActionKind::DropSpare.as_str());
    }
    if deficit <= 0 {
        return Ok(Outcome {
            actions,
            seed: String::new(),
        });
    }

    // 2. Shrink malleable runs, highest group index first per run.
    let mut shrink_order: Vec<usize> = (0..groups.len())
        .filter(|&g| run_states[&groups[g].run_key].min_width.is_some())
        .collect();
    shrink_order.sort_by(|&a, &b| {
        groups[a]
            .run_key
            .cmp(&groups[b].run_key)
            .then_with(|| numeric_index(&groups[b].index).cmp(&numeric_index(&groups[a].index)))
    });
    for g in shrink_order {
        if deficit <= 0 {
            break;
        }
        let (run_key, group_gpus) = (groups[g].run_key.clone(), groups[g].gpus);
        let Some(state) = run_states.get_mut(&run_key) else {
            continue;
        };
        let Some(min) = state.min_width else {
            continue;
        };
        if groups[g].marked || state.remaining.saturating_sub(group_gpus) < min {
            continue;
        }
        append_group_actions(
            &mut actions,
            &mut candidates,
            &mut groups[g],
            ActionKind::Shrink,
            "Shrink",
        );
        state.remaining -= group_gpus;
        deficit -= i64::from(group_gpus);
    }
    if deficit <= 0 {
        return Ok(Outcome {
            actions,
            seed: String::new(),
        });
    }

    // 3. Lottery across remaining groups.
    let seed = compute_seed(&input.seed_source, input.now);
    let mut rng = StdRng::seed_from_u64(seed_value(&seed));

    let mut tokens_by_owner: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (g, group) in groups.iter().enumerate() {
        if group.marked {
            continue;
        }
        let state = &run_states[&group.run_key];
        if let Some(min) = state.min_width {
            if state.remaining.saturating_sub(group.gpus) < min {
                continue;
            }
        }
        tokens_by_owner
            .entry(state.owner.clone())
            .or_default()
            .push(g);
    }
    if tokens_by_owner.is_empty() {
        return Err(ResolveError::NoCandidates);
    }
    let mut owners: Vec<String> = tokens_by_owner.keys().cloned().collect();

    let reason = format!("RandomPreempt({seed})");
    while deficit > 0 {
        if owners.is_empty() {
            return Err(ResolveError::LotteryExhausted);
        }
        let owner_idx = rng.gen_range(0..owners.len());
        let owner = owners[owner_idx].clone();
        let Some(tokens) = tokens_by_owner.get_mut(&owner) else {
            owners.remove(owner_idx);
            continue;
        };
        if tokens.is_empty() {
            owners.remove(owner_idx);
            continue;
        }
        let token_idx = rng.gen_range(0..tokens.len());
        let g = tokens.swap_remove(token_idx);
        let drained = tokens.is_empty();
        if drained {
            owners.remove(owner_idx);
        }
        if groups[g].marked {
            continue;
        }
        let group_gpus = groups[g].gpus;
        let Some(state) = run_states.get_mut(&groups[g].run_key) else {
            continue;
        };
        if let Some(min) = state.min_width {
            if state.remaining.saturating_sub(group_gpus) < min {
                continue;
            }
        }
        append_group_actions(
            &mut actions,
            &mut candidates,
            &mut groups[g],
            ActionKind::Lottery,
            &reason,
        );
        state.remaining -= group_gpus;
        deficit -= i64::from(group_gpus);
    }

    Ok(Outcome { actions, seed })
}

fn gather_candidates(
    input: &Input<'_>,
    node_labels: &BTreeMap<&str, &BTreeMap<String, String>>,
) -> (Vec<Candidate>, Vec<Group>, BTreeMap<String, RunState>) {
    let mut candidates = Vec::new();
    let mut groups: Vec<Group> = Vec::new();
    let mut group_lookup: BTreeMap<(String, String), usize> = BTreeMap::new();
    let mut run_states: BTreeMap<String, RunState> = BTreeMap::new();

    for lease in input.leases {
        if lease.status.closed {
            continue;
        }
        let run_key = lease.spec.run_ref.key();
        let Some(run) = input.runs.get(&run_key) else {
            continue;
        };
        if run.spec.resources.gpu_type != input.flavor {
            continue;
        }
        if !lease_in_scope(lease, node_labels, &input.scope) {
            continue;
        }
        let group_index = lease
            .metadata
            .labels
            .get(LABEL_GROUP_INDEX)
            .cloned()
            .unwrap_or_else(|| "0".to_string());
        let gpus = lease.spec.slice.nodes.len() as u32;
        let cand_idx = candidates.len();
        candidates.push(Candidate {
            lease_key: lease.metadata.key(),
            lease_name: lease.metadata.name.clone(),
            run_key: run_key.clone(),
            owner: run.spec.owner.clone(),
            role: lease.spec.slice.role,
            group_index: group_index.clone(),
            gpus,
            marked: false,
        });

        let state = run_states.entry(run_key.clone()).or_insert_with(|| RunState {
            owner: run.spec.owner.clone(),
            min_width: run.spec.malleable.as_ref().map(|m| m.min_total_gpus),
            remaining: 0,
        });
        state.remaining += gpus;

        let group_key = (run_key.clone(), group_index.clone());
        let g = *group_lookup.entry(group_key).or_insert_with(|| {
            groups.push(Group {
                run_key,
                index: group_index,
                candidates: Vec::new(),
                gpus: 0,
                marked: false,
            });
            groups.len() - 1
        });
        groups[g].candidates.push(cand_idx);
        groups[g].gpus += gpus;
    }

    (candidates, groups, run_states)
}

/// Every node of the lease must carry labels matching all scope entries.
fn lease_in_scope(
    lease: &Lease,
    node_labels: &BTreeMap<&str, &BTreeMap<String, String>>,
    scope: &BTreeMap<String, String>,
) -> bool {
    if scope.is_empty() {
        return true;
    }
    for node in lease.spec.slice.node_names() {
        let Some(labels) = node_labels.get(node) else {
            return false;
        };
        for (key, value) in scope {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    true
}

/// Ends every unmarked lease in the group.
fn append_group_actions(
    actions: &mut Vec<Action>,
    candidates: &mut [Candidate],
    group: &mut Group,
    kind: ActionKind,
    reason: &str,
) {
    group.marked = true;
    for &cand_idx in &group.candidates {
        let cand = &mut candidates[cand_idx];
        if cand.marked {
            continue;
        }
        cand.marked = true;
        actions.push(Action {
            kind,
            lease: cand.lease_key.clone(),
            run: cand.run_key.clone(),
            group_index: group.index.clone(),
            gpus: cand.gpus,
            reason: reason.to_string(),
        });
        metrics::inc_resolver_action(kind.as_str());
    }
}

fn numeric_index(index: &str) -> i64 {
    index.parse().unwrap_or(0)
}

/// Seed string: `0x` plus the first eight bytes of
/// `sha256(source | nanos)`, hex encoded.
pub fn compute_seed(source: &str, now: DateTime<Utc>) -> String {
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
    let digest = Sha256::digest(format!("{source}|{nanos}").as_bytes());
    format!("0x{}", hex::encode(&digest[..8]))
}

fn seed_value(seed: &str) -> u64 {
    let raw = hex::decode(seed.trim_start_matches("0x")).unwrap_or_default();
    if raw.len() < 8 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[..8]);
    u64::from_be_bytes(bytes)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        LeaseInterval, LeaseSlice, LeaseSpec, Meta, Run, RunMalleability, RunReference,
        RunResources, RunSpec,
    };
    use crate::binder::LABEL_GROUP_INDEX;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    fn run(name: &str, owner: &str, total: u32, malleable: Option<RunMalleability>) -> Run {
        Run {
            metadata: Meta::named(name),
            spec: RunSpec {
                owner: owner.to_string(),
                resources: RunResources {
                    gpu_type: "H100-80GB".to_string(),
                    total_gpus: total,
                },
                malleable,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn lease(name: &str, run: &str, group: &str, role: LeaseRole, slots: u32) -> Lease {
        Lease {
            metadata: Meta {
                name: name.to_string(),
                namespace: String::new(),
                labels: BTreeMap::from([(LABEL_GROUP_INDEX.to_string(), group.to_string())]),
            },
            spec: LeaseSpec {
                owner: "org:any".to_string(),
                run_ref: RunReference {
                    name: run.to_string(),
                    namespace: String::new(),
                },
                slice: LeaseSlice {
                    nodes: (0..slots).map(|i| format!("node-a#{i}")).collect(),
                    role,
                },
                interval: LeaseInterval {
                    start: now() - chrono::Duration::hours(1),
                    end: None,
                },
                paid_by_envelope: "west".to_string(),
                reason: "Start".to_string(),
            },
            ..Default::default()
        }
    }

    fn input<'a>(
        deficit: u32,
        leases: &'a [Lease],
        runs: &'a BTreeMap<String, Run>,
        nodes: &'a [SourceNode],
    ) -> Input<'a> {
        Input {
            deficit,
            flavor: "H100-80GB".to_string(),
            scope: BTreeMap::new(),
            seed_source: "res-1".to_string(),
            now: now(),
            nodes,
            leases,
            runs,
        }
    }

    #[test]
    fn zero_deficit_is_a_no_op() {
        let runs = BTreeMap::new();
        let outcome = resolve(input(0, &[], &runs, &[])).unwrap();
        assert!(outcome.actions.is_empty());
        assert!(outcome.seed.is_empty());
    }

    #[test]
    fn spares_dropped_first() {
        let mut runs = BTreeMap::new();
        runs.insert("default/a".to_string(), run("a", "org:a", 4, None));
        let leases = vec![
            lease("a-g00-active", "a", "0", LeaseRole::Active, 4),
            lease("a-g00-spare", "a", "0", LeaseRole::Spare, 2),
        ];
        let outcome = resolve(input(2, &leases, &runs, &[])).unwrap();
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].kind, ActionKind::DropSpare);
        assert_eq!(outcome.actions[0].lease, "default/a-g00-spare");
        assert_eq!(outcome.actions[0].reason, "DropSpare");
        assert!(outcome.seed.is_empty());
    }

    #[test]
    fn malleable_runs_shrink_before_lottery() {
        let mut runs = BTreeMap::new();
        runs.insert(
            "default/elastic".to_string(),
            run(
                "elastic",
                "org:a",
                8,
                Some(RunMalleability {
                    min_total_gpus: 4,
                    max_total_gpus: 8,
                    step_gpus: 4,
                    desired_total_gpus: Some(8),
                }),
            ),
        );
        let leases = vec![
            lease("elastic-g00", "elastic", "0", LeaseRole::Active, 4),
            lease("elastic-g01", "elastic", "1", LeaseRole::Active, 4),
        ];
        let outcome = resolve(input(4, &leases, &runs, &[])).unwrap();
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].kind, ActionKind::Shrink);
        // Highest group index goes first, and the min width of 4 survives.
        assert_eq!(outcome.actions[0].group_index, "1");
        assert!(outcome.seed.is_empty());
    }

    #[test]
    fn shrink_respects_min_width() {
        let mut runs = BTreeMap::new();
        runs.insert(
            "default/elastic".to_string(),
            run(
                "elastic",
                "org:a",
                8,
                Some(RunMalleability {
                    min_total_gpus: 8,
                    max_total_gpus: 8,
                    step_gpus: 4,
                    desired_total_gpus: Some(8),
                }),
            ),
        );
        let leases = vec![
            lease("elastic-g00", "elastic", "0", LeaseRole::Active, 4),
            lease("elastic-g01", "elastic", "1", LeaseRole::Active, 4),
        ];
        // Min width pins both groups; only the lottery could act, and it
        // cannot either, so the lottery reports exhaustion.
        let err = resolve(input(4, &leases, &runs, &[])).unwrap_err();
        assert_eq!(err, ResolveError::NoCandidates);
    }

    #[test]
    fn lottery_preempts_whole_group_deterministically() {
        let mut runs = BTreeMap::new();
        runs.insert("default/run-a".to_string(), run("run-a", "org:a", 8, None));
        runs.insert("default/run-b".to_string(), run("run-b", "org:b", 8, None));
        let leases = vec![
            lease("run-a-g00", "run-a", "0", LeaseRole::Active, 8),
            lease("run-b-g00", "run-b", "0", LeaseRole::Active, 8),
        ];

        let first = resolve(input(8, &leases, &runs, &[])).unwrap();
        assert_eq!(first.actions.len(), 1);
        assert_eq!(first.actions[0].kind, ActionKind::Lottery);
        assert_eq!(first.seed, compute_seed("res-1", now()));
        assert!(first.actions[0].reason.starts_with("RandomPreempt(0x"));

        // Identical inputs replay bit-for-bit.
        let second = resolve(input(8, &leases, &runs, &[])).unwrap();
        assert_eq!(first, second);

        // A different instant draws a different seed.
        let mut shifted = input(8, &leases, &runs, &[]);
        shifted.now = now() + chrono::Duration::seconds(1);
        let third = resolve(shifted).unwrap();
        assert_ne!(third.seed, first.seed);
    }

    #[test]
    fn lottery_exhaustion_is_an_error() {
        let mut runs = BTreeMap::new();
        runs.insert("default/run-a".to_string(), run("run-a", "org:a", 4, None));
        let leases = vec![lease("run-a-g00", "run-a", "0", LeaseRole::Active, 4)];
        let err = resolve(input(16, &leases, &runs, &[])).unwrap_err();
        assert_eq!(err, ResolveError::LotteryExhausted);
    }

    #[test]
    fn scope_filters_by_node_labels() {
        let mut runs = BTreeMap::new();
        runs.insert("default/run-a".to_string(), run("run-a", "org:a", 4, None));
        let leases = vec![lease("run-a-g00-spare", "run-a", "0", LeaseRole::Spare, 4)];
        let nodes = vec![SourceNode {
            name: "node-a".to_string(),
            labels: BTreeMap::from([("region".to_string(), "us-west".to_string())]),
            gpus: 8,
        }];

        let mut scoped = input(2, &leases, &runs, &nodes);
        scoped.scope = BTreeMap::from([("region".to_string(), "us-east".to_string())]);
        // The only candidate is out of scope; lottery finds nothing.
        assert_eq!(resolve(scoped).unwrap_err(), ResolveError::NoCandidates);

        let mut matching = input(2, &leases, &runs, &nodes);
        matching.scope = BTreeMap::from([("region".to_string(), "us-west".to_string())]);
        let outcome = resolve(matching).unwrap();
        assert_eq!(outcome.actions[0].kind, ActionKind::DropSpare);
    }

    #[test]
    fn seed_matches_sha256_of_source_and_nanos() {
        let seed = compute_seed("res-1", now());
        assert!(seed.starts_with("0x"));
        assert_eq!(seed.len(), 18);
        assert_eq!(seed, compute_seed("res-1", now()));
        assert_ne!(seed, compute_seed("res-2", now()));
    }
}
