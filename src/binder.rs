//! Binder
//!
//! Projects a placement plan and a funding plan into concrete pod manifests
//! and immutable lease records. A cursor walks the cover segments while the
//! group node allocations are consumed in order; every GPU is assigned to
//! exactly one pod and one lease slot, and the plans must zip up exactly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{
    Lease, LeaseInterval, LeaseRole, LeaseSlice, LeaseSpec, Meta, Run, RunReference,
};
use crate::{cover, pack};

/// Label marking pods and leases tied to a Run.
pub const LABEL_RUN_NAME: &str = "jobtree.io/run";
/// Label marking the logical group index.
pub const LABEL_GROUP_INDEX: &str = "jobtree.io/group-index";
/// Label marking whether a pod is active, borrowed, or spare.
pub const LABEL_ROLE: &str = "jobtree.io/role";

/// Errors from materialization. These indicate a mismatch between the two
/// plans and are not normally reachable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BindError {
    /// The pack plan carries no groups
    #[error("pack plan has no groups")]
    EmptyPackPlan,
    /// The cover plan carries no segments
    #[error("cover plan has no segments")]
    EmptyCoverPlan,
    /// All segments resolved to zero quantity
    #[error("cover plan resolved to zero quantity")]
    ZeroQuantity,
    /// Segments ran out before every GPU was assigned
    #[error("cover plan exhausted before assignments completed")]
    Exhausted,
    /// A group requested spares but the plan has no spare placements
    #[error("group {group} requested spares but no placements provided")]
    SpareWithoutPlacement {
        /// Offending group index
        group: u32,
    },
    /// Cover quantity was left over after all placements
    #[error("unused cover quantity remains after placement")]
    UnusedCover,
}

/// The minimal data needed to create a pod-like workload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodManifest {
    /// Pod namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Node the pod is bound to
    pub node_name: String,
    /// GPUs requested by the pod
    pub gpus: u32,
    /// Run / group-index / role labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Context for materializing one bind.
pub struct Request<'a> {
    /// The run being bound
    pub run: &'a Run,
    /// Placement plan
    pub pack_plan: &'a pack::Plan,
    /// Funding plan
    pub cover_plan: &'a cover::Plan,
    /// Bind instant; stamped into lease names and intervals
    pub now: DateTime<Utc>,
    /// Added to every group index; used by elastic growth to extend a run
    pub group_index_offset: u32,
    /// Lease creation reason; defaults to "Start" when empty
    pub lease_reason: &'a str,
}

/// The objects a bind produces.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Output {
    /// Pod manifests to create
    pub pods: Vec<PodManifest>,
    /// Leases to append to the ledger
    pub leases: Vec<Lease>,
}

struct SegmentCursor {
    segment: cover::Segment,
    remaining: u32,
}

/// Constructs pods and leases for the provided request.
pub fn materialize(req: Request<'_>) -> Result<Output, BindError> {
    if req.pack_plan.groups.is_empty() {
        return Err(BindError::EmptyPackPlan);
    }
    if req.cover_plan.segments.is_empty() {
        return Err(BindError::EmptyCoverPlan);
    }
    let mut segments: Vec<SegmentCursor> = req
        .cover_plan
        .segments
        .iter()
        .filter(|s| s.quantity > 0)
        .map(|s| SegmentCursor {
            segment: s.clone(),
            remaining: s.quantity,
        })
        .collect();
    if segments.is_empty() {
        return Err(BindError::ZeroQuantity);
    }

    let reason = if req.lease_reason.is_empty() {
        "Start"
    } else {
        req.lease_reason
    };
    let mut output = Output::default();

    for group in &req.pack_plan.groups {
        let index = group.group_index + req.group_index_offset;
        bind_allocations(
            &mut output,
            &mut segments,
            &req,
            index,
            &group.node_placements,
            reason,
            false,
        )?;
    }

    for group in &req.pack_plan.groups {
        if group.spares == 0 {
            continue;
        }
        if group.spare_placements.is_empty() {
            return Err(BindError::SpareWithoutPlacement {
                group: group.group_index,
            });
        }
        let index = group.group_index + req.group_index_offset;
        bind_allocations(
            &mut output,
            &mut segments,
            &req,
            index,
            &group.spare_placements,
            reason,
            true,
        )?;
    }

    if segments.iter().any(|s| s.remaining > 0) {
        return Err(BindError::UnusedCover);
    }

    Ok(output)
}

/// Chains one group's allocations against the segment cursor, emitting one
/// pod and one lease per (node chunk, segment chunk) pair.
fn bind_allocations(
    output: &mut Output,
    segments: &mut Vec<SegmentCursor>,
    req: &Request<'_>,
    group_index: u32,
    allocations: &[pack::NodeAllocation],
    reason: &str,
    spare: bool,
) -> Result<(), BindError> {
    for alloc in allocations {
        let mut ordinal = 0;
        let mut remaining = alloc.gpus;
        while remaining > 0 {
            let Some(cursor) = segments.first_mut() else {
                return Err(BindError::Exhausted);
            };
            let take = cursor.remaining.min(remaining);
            if take == 0 {
                return Err(BindError::Exhausted);
            }
            let role = if spare {
                LeaseRole::Spare
            } else if cursor.segment.borrowed {
                LeaseRole::Borrowed
            } else {
                LeaseRole::Active
            };

            output
                .pods
                .push(build_pod(req.run, group_index, &alloc.node, take, role));
            output.leases.push(build_lease(
                req,
                group_index,
                &alloc.node,
                ordinal,
                take,
                &cursor.segment,
                role,
                reason,
            ));

            remaining -= take;
            ordinal += take;
            cursor.remaining -= take;
            if cursor.remaining == 0 {
                segments.remove(0);
            }
        }
    }
    Ok(())
}

fn build_pod(run: &Run, group_index: u32, node: &str, gpus: u32, role: LeaseRole) -> PodManifest {
    let role_str = role.to_string();
    PodManifest {
        namespace: run.metadata.namespace.clone(),
        name: format!(
            "{}-g{:02}-{}-{}",
            run.metadata.name,
            group_index,
            role_str.to_lowercase(),
            node
        ),
        node_name: node.to_string(),
        gpus,
        labels: bind_labels(&run.metadata.name, group_index, &role_str),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_lease(
    req: &Request<'_>,
    group_index: u32,
    node: &str,
    ordinal: u32,
    take: u32,
    segment: &cover::Segment,
    role: LeaseRole,
    reason: &str,
) -> Lease {
    let run = req.run;
    let nanos = req
        .now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| req.now.timestamp());
    let slots = (ordinal..ordinal + take)
        .map(|i| format!("{node}#{i}"))
        .collect();
    Lease {
        metadata: Meta {
            name: format!(
                "{}-g{:02}-{}-{}-{}",
                run.metadata.name, group_index, segment.envelope_name, node, nanos
            ),
            namespace: run.metadata.namespace.clone(),
            labels: bind_labels(&run.metadata.name, group_index, &role.to_string()),
        },
        spec: LeaseSpec {
            owner: run.spec.owner.clone(),
            run_ref: RunReference {
                name: run.metadata.name.clone(),
                namespace: run.metadata.namespace.clone(),
            },
            slice: LeaseSlice { nodes: slots, role },
            interval: LeaseInterval {
                start: req.now,
                end: None,
            },
            paid_by_envelope: segment.envelope_name.clone(),
            reason: reason.to_string(),
        },
        ..Default::default()
    }
}

fn bind_labels(run: &str, group_index: u32, role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_RUN_NAME.to_string(), run.to_string()),
        (LABEL_GROUP_INDEX.to_string(), group_index.to_string()),
        (LABEL_ROLE.to_string(), role.to_string()),
    ])
}

// =============================================================================
// Tests
// =============================================================================
