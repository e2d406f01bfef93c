//! Placement planner
//!
//! Chooses domains and nodes for a Run's groups and spares on a cloned
//! topology snapshot. Three strategies, keyed off the locality request:
//! single-domain when spreading is disallowed, per-group domain selection
//! when a group size is given, and fill-largest otherwise. Spares are
//! allocated per group after its active GPUs, preferring the group's own
//! domain and falling back across domains.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::topology::{sorted_node_indices, Domain, DomainKey, Snapshot};

/// Why placement planning failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The request itself is malformed
    InvalidRequest,
    /// No single domain can satisfy the grouping constraint
    InsufficientTopology,
    /// Not enough free GPUs altogether
    InsufficientCapacity,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "InvalidRequest"),
            Self::InsufficientTopology => write!(f, "InsufficientTopology"),
            Self::InsufficientCapacity => write!(f, "InsufficientCapacity"),
        }
    }
}

/// Returned when planning fails; callers switch on `reason`.
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

/// Inputs for a placement plan.
#[derive(Clone, Debug, Default)]
pub struct Request {
    /// GPU flavor; must match the snapshot
    pub flavor: String,
    /// Total GPUs to place
    pub total_gpus: u32,
    /// Shard into groups of this size
    pub group_gpus: Option<u32>,
    /// Whether groups may land in different domains
    pub allow_cross_group_spread: bool,
    /// Extra GPUs per group reserved for swap
    pub spares_per_group: u32,
}

/// An assignment of GPUs on a specific node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAllocation {
    /// Node name
    pub node: String,
    /// GPUs taken on that node
    pub gpus: u32,
}

/// Where one logical group of GPUs will run.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupPlacement {
    /// Group ordinal within the plan
    pub group_index: u32,
    /// Active GPUs in the group
    pub size: u32,
    /// Domain the group's active GPUs land in
    pub domain: DomainKey,
    /// Active allocations, sorted by (gpus desc, node asc)
    pub node_placements: Vec<NodeAllocation>,
    /// Spare GPUs allocated for this group
    pub spares: u32,
    /// Spare allocations; may fall outside `domain` on overflow
    pub spare_placements: Vec<NodeAllocation>,
}

/// Outcome of a packing request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    /// GPU flavor
    pub flavor: String,
    /// Total active GPUs placed
    pub total_gpus: u32,
    /// Per-group placements
    pub groups: Vec<GroupPlacement>,
    /// Spare GPUs placed across all groups
    pub total_spares: u32,
    /// Free GPUs left per domain after this plan
    pub residual: BTreeMap<DomainKey, u32>,
}

/// Computes a placement plan for the request against the snapshot.
pub fn plan(snapshot: &Snapshot, req: &Request) -> Result<Plan, PlanError> {
    if req.total_gpus == 0 {
        return Err(PlanError::new(
            FailureReason::InvalidRequest,
            "totalGPUs must be positive",
        ));
    }
    if req.flavor.is_empty() {
        return Err(PlanError::new(
            FailureReason::InvalidRequest,
            "flavor must be set",
        ));
    }
    if req.flavor != snapshot.flavor {
        return Err(PlanError::new(
            FailureReason::InvalidRequest,
            "snapshot flavor mismatch",
        ));
    }
    if req.group_gpus == Some(0) {
        return Err(PlanError::new(
            FailureReason::InvalidRequest,
            "groupGPUs must be positive when set",
        ));
    }

    let mut work = snapshot.clone();
    let mut groups = if !req.allow_cross_group_spread {
        plan_single_domain(&mut work, req)?
    } else if req.group_gpus.is_some() {
        plan_with_groups(&mut work, req)?
    } else {
        plan_fill_domains(&mut work, req)?
    };

    let mut total_spares = 0;
    if req.spares_per_group > 0 {
        for group in &mut groups {
            let placements = allocate_spares(&mut work, &group.domain, req.spares_per_group)?;
            group.spares = req.spares_per_group;
            group.spare_placements = placements;
            total_spares += req.spares_per_group;
        }
    }

    let residual = work
        .domains
        .iter()
        .map(|d| (d.key.clone(), d.free_gpus()))
        .collect();

    Ok(Plan {
        flavor: req.flavor.clone(),
        total_gpus: req.total_gpus,
        groups,
        total_spares,
        residual,
    })
}

/// All groups inside the first domain that fits the whole request.
fn plan_single_domain(work: &mut Snapshot, req: &Request) -> Result<Vec<GroupPlacement>, PlanError> {
    let candidate = work
        .sorted_domain_indices()
        .into_iter()
        .find(|&i| work.domains[i].free_gpus() >= req.total_gpus)
        .ok_or_else(|| {
            PlanError::new(
                FailureReason::InsufficientTopology,
                "no single domain can satisfy request",
            )
        })?;

    let sizes = derive_groups(req.total_gpus, req.group_gpus);
    let key = work.domains[candidate].key.clone();
    let mut placements = Vec::with_capacity(sizes.len());
    for (idx, size) in sizes.into_iter().enumerate() {
        let allocs = allocate_in_domain(&mut work.domains[candidate], size)?;
        placements.push(GroupPlacement {
            group_index: idx as u32,
            size,
            domain: key.clone(),
            node_placements: allocs,
            spares: 0,
            spare_placements: Vec::new(),
        });
    }
    Ok(placements)
}

/// One domain per group, preferring domains this plan already used.
fn plan_with_groups(work: &mut Snapshot, req: &Request) -> Result<Vec<GroupPlacement>, PlanError> {
    let sizes = derive_groups(req.total_gpus, req.group_gpus);
    let mut used: BTreeMap<DomainKey, u32> = BTreeMap::new();
    let mut placements = Vec::with_capacity(sizes.len());
    for (idx, size) in sizes.into_iter().enumerate() {
        let chosen = choose_domain_for_group(work, &used, size).ok_or_else(|| {
            PlanError::new(
                FailureReason::InsufficientCapacity,
                format!("insufficient capacity for group {idx}"),
            )
        })?;
        let key = work.domains[chosen].key.clone();
        let allocs = allocate_in_domain(&mut work.domains[chosen], size)?;
        *used.entry(key.clone()).or_insert(0) += size;
        placements.push(GroupPlacement {
            group_index: idx as u32,
            size,
            domain: key,
            node_placements: allocs,
            spares: 0,
            spare_placements: Vec::new(),
        });
    }
    Ok(placements)
}

/// Greedy fill: take from the current largest-free domain until done.
fn plan_fill_domains(work: &mut Snapshot, req: &Request) -> Result<Vec<GroupPlacement>, PlanError> {
    let mut remaining = req.total_gpus;
    let mut placements = Vec::new();
    let mut group_index = 0;
    while remaining > 0 {
        let chosen = work
            .sorted_domain_indices()
            .into_iter()
            .find(|&i| work.domains[i].free_gpus() > 0)
            .ok_or_else(|| {
                PlanError::new(FailureReason::InsufficientCapacity, "insufficient capacity")
            })?;
        let assign = work.domains[chosen].free_gpus().min(remaining);
        let key = work.domains[chosen].key.clone();
        let allocs = allocate_in_domain(&mut work.domains[chosen], assign)?;
        placements.push(GroupPlacement {
            group_index,
            size: assign,
            domain: key,
            node_placements: allocs,
            spares: 0,
            spare_placements: Vec::new(),
        });
        remaining -= assign;
        group_index += 1;
    }
    Ok(placements)
}

/// Picks the best domain with room for `size`, preferring ones this plan
/// already placed a group into, then by (free desc, key asc).
fn choose_domain_for_group(
    work: &Snapshot,
    used: &BTreeMap<DomainKey, u32>,
    size: u32,
) -> Option<usize> {
    let candidates: Vec<usize> = work
        .sorted_domain_indices()
        .into_iter()
        .filter(|&i| work.domains[i].free_gpus() >= size)
        .collect();
    candidates
        .iter()
        .copied()
        .find(|&i| used.contains_key(&work.domains[i].key))
        .or_else(|| candidates.first().copied())
}

/// Spare GPUs for one group: its own domain first, then any domain with
/// free capacity in snapshot order.
fn allocate_spares(
    work: &mut Snapshot,
    group_domain: &DomainKey,
    amount: u32,
) -> Result<Vec<NodeAllocation>, PlanError> {
    let mut remaining = amount;
    let mut allocs = Vec::new();

    if let Some(home) = work.domains.iter().position(|d| &d.key == group_domain) {
        let take = work.domains[home].free_gpus().min(remaining);
        if take > 0 {
            allocs.extend(allocate_in_domain(&mut work.domains[home], take)?);
            remaining -= take;
        }
    }

    while remaining > 0 {
        let Some(next) = work
            .sorted_domain_indices()
            .into_iter()
            .find(|&i| work.domains[i].free_gpus() > 0)
        else {
            return Err(PlanError::new(
                FailureReason::InsufficientCapacity,
                "insufficient capacity for spares",
            ));
        };
        let take = work.domains[next].free_gpus().min(remaining);
        allocs.extend(allocate_in_domain(&mut work.domains[next], take)?);
        remaining -= take;
    }

    Ok(allocs)
}

/// Takes `amount` GPUs inside a domain, node by node in free-descending
/// order, mutating the node usage. Allocations come back sorted by
/// (gpus desc, node asc).
fn allocate_in_domain(domain: &mut Domain, amount: u32) -> Result<Vec<NodeAllocation>, PlanError> {
    if amount == 0 {
        return Err(PlanError::new(
            FailureReason::InvalidRequest,
            "group size must be positive",
        ));
    }
    if domain.free_gpus() < amount {
        return Err(PlanError::new(
            FailureReason::InsufficientCapacity,
            "domain does not have enough capacity",
        ));
    }
    let order = sorted_node_indices(&domain.nodes);
    let mut remaining = amount;
    let mut allocs = Vec::new();
    for idx in order {
        if remaining == 0 {
            break;
        }
        let node = &mut domain.nodes[idx];
        let free = node.free_gpus();
        if free == 0 {
            continue;
        }
        let take = free.min(remaining);
        node.used += take;
        allocs.push(NodeAllocation {
            node: node.name.clone(),
            gpus: take,
        });
        remaining -= take;
    }
    if remaining > 0 {
        // Unreachable when the pre-check passed; kept as a guard.
        return Err(PlanError::new(
            FailureReason::InsufficientCapacity,
            "insufficient node capacity",
        ));
    }
    allocs.sort_by(|a, b| b.gpus.cmp(&a.gpus).then_with(|| a.node.cmp(&b.node)));
    Ok(allocs)
}

/// Splits `total` into group sizes; the last group may be smaller.
fn derive_groups(total: u32, group_size: Option<u32>) -> Vec<u32> {
    let Some(size) = group_size else {
        return vec![total];
    };
    let mut groups = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let take = size.min(remaining);
        groups.push(take);
        remaining -= take;
    }
    groups
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{build_snapshot_for_flavor, SourceNode};
    use crate::topology::{LABEL_CLUSTER, LABEL_FABRIC_DOMAIN, LABEL_GPU_FLAVOR, LABEL_REGION};

    fn node(name: &str, fabric: &str, gpus: u32) -> SourceNode {
        SourceNode {
            name: name.to_string(),
            labels: BTreeMap::from([
                (LABEL_GPU_FLAVOR.to_string(), "H100-80GB".to_string()),
                (LABEL_REGION.to_string(), "us-west".to_string()),
                (LABEL_CLUSTER.to_string(), "cluster-a".to_string()),
                (LABEL_FABRIC_DOMAIN.to_string(), fabric.to_string()),
            ]),
            gpus,
        }
    }

    fn snapshot(nodes: &[SourceNode]) -> Snapshot {
        build_snapshot_for_flavor(nodes, &BTreeMap::new(), "H100-80GB").unwrap()
    }

    fn request(total: u32) -> Request {
        Request {
            flavor: "H100-80GB".to_string(),
            total_gpus: total,
            allow_cross_group_spread: true,
            ..Default::default()
        }
    }

    #[test]
    fn invalid_requests_rejected() {
        let snap = snapshot(&[node("node-a", "island-a", 8)]);
        let err = plan(&snap, &request(0)).unwrap_err();
        assert_eq!(err.reason, FailureReason::InvalidRequest);

        let mut wrong_flavor = request(4);
        wrong_flavor.flavor = "A100-40GB".to_string();
        let err = plan(&snap, &wrong_flavor).unwrap_err();
        assert_eq!(err.reason, FailureReason::InvalidRequest);
    }

    #[test]
    fn single_domain_mode_needs_one_big_domain() {
        let snap = snapshot(&[
            node("node-a", "island-a", 4),
            node("node-b", "island-b", 4),
        ]);
        let mut req = request(6);
        req.allow_cross_group_spread = false;
        let err = plan(&snap, &req).unwrap_err();
        assert_eq!(err.reason, FailureReason::InsufficientTopology);

        req.total_gpus = 4;
        let p = plan(&snap, &req).unwrap();
        assert_eq!(p.groups.len(), 1);
        assert_eq!(p.groups[0].size, 4);
    }

    #[test]
    fn groups_prefer_already_used_domains() {
        // island-b is largest so group 0 lands there; group 1 prefers the
        // same domain over the untouched island-a.
        let snap = snapshot(&[
            node("node-a", "island-a", 8),
            node("node-b", "island-b", 10),
        ]);
        let mut req = request(8);
        req.group_gpus = Some(4);
        let p = plan(&snap, &req).unwrap();
        assert_eq!(p.groups.len(), 2);
        assert_eq!(p.groups[0].domain.fabric, "island-b");
        assert_eq!(p.groups[1].domain.fabric, "island-b");
        assert_eq!(p.residual[&p.groups[0].domain], 2);
    }

    #[test]
    fn last_group_may_be_smaller() {
        let snap = snapshot(&[node("node-a", "island-a", 16)]);
        let mut req = request(10);
        req.group_gpus = Some(4);
        let p = plan(&snap, &req).unwrap();
        let sizes: Vec<u32> = p.groups.iter().map(|g| g.size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(p.groups.iter().map(|g| g.size).sum::<u32>(), 10);
    }

    #[test]
    fn fill_mode_drains_largest_domains_first() {
        let snap = snapshot(&[
            node("node-a", "island-a", 2),
            node("node-b", "island-b", 6),
        ]);
        let p = plan(&snap, &request(8)).unwrap();
        assert_eq!(p.groups.len(), 2);
        assert_eq!(p.groups[0].domain.fabric, "island-b");
        assert_eq!(p.groups[0].size, 6);
        assert_eq!(p.groups[1].domain.fabric, "island-a");
        assert_eq!(p.groups[1].size, 2);
    }

    #[test]
    fn fill_mode_fails_when_cluster_exhausted() {
        let snap = snapshot(&[node("node-a", "island-a", 4)]);
        let err = plan(&snap, &request(6)).unwrap_err();
        assert_eq!(err.reason, FailureReason::InsufficientCapacity);
    }

    #[test]
    fn allocations_sorted_by_size_then_name() {
        let snap = snapshot(&[
            node("node-a", "island-a", 2),
            node("node-b", "island-a", 6),
        ]);
        let p = plan(&snap, &request(8)).unwrap();
        let allocs = &p.groups[0].node_placements;
        assert_eq!(allocs[0].node, "node-b");
        assert_eq!(allocs[0].gpus, 6);
        assert_eq!(allocs[1].node, "node-a");
        assert_eq!(allocs[1].gpus, 2);
    }

    #[test]
    fn spares_land_in_group_domain_when_possible() {
        let snap = snapshot(&[
            node("node-a", "island-a", 6),
            node("node-b", "island-b", 4),
        ]);
        let mut req = request(4);
        req.spares_per_group = 1;
        let p = plan(&snap, &req).unwrap();
        assert_eq!(p.total_spares, 1);
        assert_eq!(p.groups[0].spares, 1);
        assert_eq!(p.groups[0].spare_placements[0].node, "node-a");
    }

    #[test]
    fn spares_fall_back_across_domains() {
        // island-a is fully consumed by the group; the spare must come from
        // island-b even in single-domain mode.
        let snap = snapshot(&[
            node("node-a", "island-a", 4),
            node("node-b", "island-b", 2),
        ]);
        let mut req = request(4);
        req.allow_cross_group_spread = false;
        req.spares_per_group = 1;
        let p = plan(&snap, &req).unwrap();
        assert_eq!(p.groups[0].spare_placements[0].node, "node-b");
    }

    #[test]
    fn spares_exhaustion_is_capacity_failure() {
        let snap = snapshot(&[node("node-a", "island-a", 4)]);
        let mut req = request(4);
        req.spares_per_group = 1;
        let err = plan(&snap, &req).unwrap_err();
        assert_eq!(err.reason, FailureReason::InsufficientCapacity);
    }

    #[test]
    fn plan_covers_exact_request() {
        let snap = snapshot(&[
            node("node-a", "island-a", 8),
            node("node-b", "island-b", 8),
        ]);
        let mut req = request(12);
        req.group_gpus = Some(4);
        let p = plan(&snap, &req).unwrap();
        assert_eq!(p.groups.iter().map(|g| g.size).sum::<u32>(), 12);
        let placed: u32 = p
            .groups
            .iter()
            .flat_map(|g| g.node_placements.iter())
            .map(|a| a.gpus)
            .sum();
        assert_eq!(placed, 12);
    }
}
