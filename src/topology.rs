//! Per-flavor topology snapshots
//!
//! Nodes of one GPU flavor are grouped into fast-fabric domains keyed by
//! (region, cluster, fabric). The snapshot's orderings are observable
//! contracts: the packer depends on domains sorted by free GPUs descending
//! (key ascending on ties) and on nodes sorted free-descending, name
//! ascending, during allocation.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label identifying the geographical region of a node.
pub const LABEL_REGION: &str = "region";
/// Label identifying the cluster within a region.
pub const LABEL_CLUSTER: &str = "cluster";
/// Label marking the fast-fabric domain / island of a node.
pub const LABEL_FABRIC_DOMAIN: &str = "fabric.domain";
/// Optional rack identifier, carried through for tie breaking.
pub const LABEL_RACK: &str = "rack";
/// Label declaring the GPU flavor a node provides.
pub const LABEL_GPU_FLAVOR: &str = "gpu.flavor";

/// Errors from snapshot construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// An admitted node is missing one of the region/cluster/fabric labels.
    #[error("node {node} missing topology labels")]
    MissingLabels {
        /// Offending node name
        node: String,
    },
    /// Reported usage exceeds a node's capacity.
    #[error("node {node} usage {used} exceeds capacity {capacity}")]
    UsageExceedsCapacity {
        /// Offending node name
        node: String,
        /// Reported used GPUs
        used: u32,
        /// Node capacity
        capacity: u32,
    },
}

/// Minimal node information from the host inventory.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceNode {
    /// Node name
    pub name: String,
    /// Node labels, including the topology and flavor labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Schedulable GPU count
    #[serde(default)]
    pub gpus: u32,
}

/// Identifies a fast-fabric domain scoped by region and cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainKey {
    /// Geographical region
    pub region: String,
    /// Cluster within the region
    pub cluster: String,
    /// Fast-fabric island
    pub fabric: String,
}

impl DomainKey {
    /// The key expressed as scope labels.
    pub fn as_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_REGION.to_string(), self.region.clone()),
            (LABEL_CLUSTER.to_string(), self.cluster.clone()),
            (LABEL_FABRIC_DOMAIN.to_string(), self.fabric.clone()),
        ])
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.cluster, self.fabric)
    }
}

/// A schedulable GPU provider inside a domain.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Node name
    pub name: String,
    /// Carried-through labels (rack)
    pub labels: BTreeMap<String, String>,
    /// Total GPUs
    pub capacity: u32,
    /// GPUs already consumed
    pub used: u32,
}

impl Node {
    /// Remaining capacity on the node.
    pub fn free_gpus(&self) -> u32 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Nodes sharing a fast-fabric interconnect.
#[derive(Clone, Debug, PartialEq)]
pub struct Domain {
    /// Domain identity
    pub key: DomainKey,
    /// GPU flavor of the member nodes
    pub flavor: String,
    /// Member nodes, sorted by name at build time
    pub nodes: Vec<Node>,
}

impl Domain {
    /// Total GPUs (used + free) in the domain.
    pub fn total_gpus(&self) -> u32 {
        self.nodes.iter().map(|n| n.capacity).sum()
    }

    /// Remaining capacity across the domain.
    pub fn free_gpus(&self) -> u32 {
        self.nodes.iter().map(|n| n.free_gpus()).sum()
    }
}

/// The available domains for one GPU flavor.
///
/// A snapshot is owned by the reconcile call that built it; the packer
/// mutates a [`Snapshot::clone`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// GPU flavor the snapshot covers
    pub flavor: String,
    /// Domains, sorted by free GPUs descending (key ascending on ties) at
    /// build time
    pub domains: Vec<Domain>,
}

impl Snapshot {
    /// Aggregate free capacity across all domains.
    pub fn total_free_gpus(&self) -> u32 {
        self.domains.iter().map(|d| d.free_gpus()).sum()
    }

    /// The domain with the highest current free GPU count.
    pub fn largest_domain(&self) -> Option<&Domain> {
        let order = self.sorted_domain_indices();
        order.first().map(|&i| &self.domains[i])
    }

    /// Looks up a domain by key.
    pub fn domain_by_key(&self, key: &DomainKey) -> Option<&Domain> {
        self.domains.iter().find(|d| &d.key == key)
    }

    /// Domain indices ordered by current free GPUs descending, breaking
    /// ties by key. Recomputed on each call since allocation mutates free
    /// counts.
    pub fn sorted_domain_indices(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.domains.len()).collect();
        order.sort_by(|&a, &b| {
            let (da, db) = (&self.domains[a], &self.domains[b]);
            db.free_gpus()
                .cmp(&da.free_gpus())
                .then_with(|| da.key.cmp(&db.key))
        });
        order
    }
}

/// Node indices within a domain ordered by free GPUs descending, name
/// ascending on ties.
pub fn sorted_node_indices(nodes: &[Node]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|&a, &b| {
        nodes[b]
            .free_gpus()
            .cmp(&nodes[a].free_gpus())
            .then_with(|| nodes[a].name.cmp(&nodes[b].name))
    });
    order
}

/// Constructs a topology snapshot filtering `nodes` by GPU flavor.
///
/// `usage` maps node name to GPUs already consumed on that node. Nodes of
/// the flavor missing region/cluster/fabric labels are rejected, as is
/// usage above capacity. Zero-GPU nodes are skipped.
pub fn build_snapshot_for_flavor(
    nodes: &[SourceNode],
    usage: &BTreeMap<String, u32>,
    flavor: &str,
) -> Result<Snapshot, TopologyError> {
    let mut domains: BTreeMap<DomainKey, Domain> = BTreeMap::new();

    for node in nodes {
        if node.labels.get(LABEL_GPU_FLAVOR).map(String::as_str) != Some(flavor) {
            continue;
        }
        let region = node.labels.get(LABEL_REGION).cloned().unwrap_or_default();
        let cluster = node.labels.get(LABEL_CLUSTER).cloned().unwrap_or_default();
        let fabric = node
            .labels
            .get(LABEL_FABRIC_DOMAIN)
            .cloned()
            .unwrap_or_default();
        if region.is_empty() || cluster.is_empty() || fabric.is_empty() {
            return Err(TopologyError::MissingLabels {
                node: node.name.clone(),
            });
        }
        if node.gpus == 0 {
            continue;
        }
        let used = usage.get(&node.name).copied().unwrap_or(0);
        if used > node.gpus {
            return Err(TopologyError::UsageExceedsCapacity {
                node: node.name.clone(),
                used,
                capacity: node.gpus,
            });
        }
        let key = DomainKey {
            region,
            cluster,
            fabric,
        };
        let domain = domains.entry(key.clone()).or_insert_with(|| Domain {
            key,
            flavor: flavor.to_string(),
            nodes: Vec::new(),
        });
        let mut labels = BTreeMap::new();
        if let Some(rack) = node.labels.get(LABEL_RACK) {
            labels.insert(LABEL_RACK.to_string(), rack.clone());
        }
        domain.nodes.push(Node {
            name: node.name.clone(),
            labels,
            capacity: node.gpus,
            used,
        });
    }

    let mut domains: Vec<Domain> = domains.into_values().collect();
    for domain in &mut domains {
        domain.nodes.sort_by(|a, b| a.name.cmp(&b.name));
    }
    domains.sort_by(|a, b| {
        b.free_gpus()
            .cmp(&a.free_gpus())
            .then_with(|| a.key.cmp(&b.key))
    });

    Ok(Snapshot {
        flavor: flavor.to_string(),
        domains,
    })
}

// =============================================================================
// Tests
// =============================================================================
