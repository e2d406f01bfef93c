//! Manifest types for the jobtree controller
//!
//! Four kinds drive the core: [`Run`] (the researcher request), [`Budget`]
//! (envelopes and caps owned by a team), [`Lease`] (immutable consumption
//! record), and [`Reservation`] (a planned future start). Each follows the
//! spec/status split; validation lives next to the types and is surfaced
//! verbatim by the host.

mod budget;
mod lease;
mod meta;
mod reservation;
mod run;

pub use budget::{
    AggregateCap, AutoRenewSchedule, Budget, BudgetSpec, BudgetStatus, CapHeadroomStatus,
    Envelope, EnvelopeHeadroomStatus, LendingPolicy, PreActivationPolicy,
};
pub(crate) use budget::selector_matches;
pub use lease::{Lease, LeaseInterval, LeaseRole, LeaseSlice, LeaseSpec, LeaseStatus};
pub(crate) use lease::node_from_slot;
pub use meta::{namespaced_key, Meta, RunReference};
pub use reservation::{
    IntendedSlice, Reservation, ReservationForecast, ReservationSpec, ReservationState,
    ReservationStatus,
};
pub use run::{
    Run, RunFunding, RunFundingStatus, RunLocality, RunMalleability, RunPhase, RunResources,
    RunSpec, RunStatus, SponsorShare, WidthStatus,
};
