//! Cluster state persistence
//!
//! The host CLI keeps the whole [`ClusterState`] in a single JSON snapshot
//! with the shape `{runs, budgets, nodes, leases, pods, reservations}`.
//! Empty collections are omitted and lists are serialized in name-sorted
//! order so consecutive snapshots diff cleanly. Loading a missing file
//! yields an empty state.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::api::{Budget, Lease, Reservation, Run};
use crate::binder::PodManifest;
use crate::controller::ClusterState;
use crate::topology::SourceNode;
use crate::Result;

/// Serializable representation of [`ClusterState`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct StateSnapshot {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    runs: Vec<Run>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    budgets: Vec<Budget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    nodes: Vec<SourceNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    leases: Vec<Lease>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pods: Vec<PodManifest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    reservations: Vec<Reservation>,
}

/// Loads the cluster state from `path`, returning an empty state when the
/// file does not exist yet.
pub fn load(path: &Path) -> Result<ClusterState> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ClusterState::default());
        }
        Err(err) => return Err(err.into()),
    };
    let snapshot: StateSnapshot = serde_json::from_slice(&data)?;
    Ok(from_snapshot(snapshot))
}

/// Persists the cluster state to `path`, creating parent directories as
/// needed.
pub fn save(path: &Path, state: &ClusterState) -> Result<()> {
    let snapshot = to_snapshot(state);
    let payload = serde_json::to_vec_pretty(&snapshot)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, payload)?;
    Ok(())
}

fn from_snapshot(snapshot: StateSnapshot) -> ClusterState {
    let mut state = ClusterState {
        budgets: snapshot.budgets,
        nodes: snapshot.nodes,
        leases: snapshot.leases,
        pods: snapshot.pods,
        ..Default::default()
    };
    for run in snapshot.runs {
        state.runs.insert(run.key(), run);
    }
    for reservation in snapshot.reservations {
        state.reservations.insert(reservation.key(), reservation);
    }
    state
}

fn to_snapshot(state: &ClusterState) -> StateSnapshot {
    let mut snapshot = StateSnapshot {
        // BTreeMap iteration gives ascending key order for free.
        runs: state.runs.values().cloned().collect(),
        reservations: state.reservations.values().cloned().collect(),
        budgets: state.budgets.clone(),
        nodes: state.nodes.clone(),
        leases: state.leases.clone(),
        pods: state.pods.clone(),
    };
    snapshot.budgets.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    snapshot.nodes.sort_by(|a, b| a.name.cmp(&b.name));
    snapshot.leases.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    snapshot.pods.sort_by(|a, b| a.name.cmp(&b.name));
    snapshot
}

// =============================================================================
// Tests
// =============================================================================
