//! jobtree - admission and placement controller for a shared GPU cluster
//!
//! Researchers describe training jobs ("Runs") at a high level: GPU flavor,
//! total GPU count, locality hints, optional elastic width, optional
//! borrowing. The controller continuously decides whether each Run can start
//! now, must wait behind a future Reservation, must borrow from sponsors, or
//! must free capacity held by other work.
//!
//! # Architecture
//!
//! The admission pipeline for one Run is a fixed chain of planners, each a
//! deterministic function over a snapshot of cluster state:
//!
//! - [`topology`] - per-flavor snapshot of fast-fabric domains and free GPUs
//! - [`accounting`] - per-envelope usage and headroom derived from leases
//! - [`pack`] - placement planner: groups and spares onto domains and nodes
//! - [`cover`] - funding planner: envelopes across the family sharing order
//! - [`forecast`] - Reservation artifact when admission is blocked
//! - [`resolver`] - staged deficit clearing at reservation activation
//! - [`binder`] - pod manifests and immutable lease records from the plans
//! - [`controller`] - orchestration: reconcile, elastic width, activation,
//!   node-failure spare swap
//! - [`metrics`] - admission latency, backlog, resolver and budget gauges
//! - [`api`] - the manifest types (Run, Budget, Lease, Reservation)
//! - [`state`] - JSON snapshot persistence for the host CLI

#![deny(missing_docs)]

pub mod accounting;
pub mod api;
pub mod binder;
pub mod clock;
pub mod controller;
pub mod cover;
pub mod error;
pub mod forecast;
pub mod metrics;
pub mod pack;
pub mod resolver;
pub mod state;
pub mod topology;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
