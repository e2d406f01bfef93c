//! Error types for the jobtree controller
//!
//! Component planners surface typed failures with a `reason` field so the
//! reconciler can switch on the reason rather than inspecting messages.
//! This module aggregates those into the crate-level [`Error`] returned by
//! the controller and the state store.

use thiserror::Error;

/// Main error type for jobtree operations
#[derive(Debug, Error)]
pub enum Error {
    /// A manifest failed validation
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.resources.totalGPUs")
        field: Option<String>,
    },

    /// A referenced object does not exist in the cluster state
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind (Run, Reservation, ...)
        kind: String,
        /// Namespaced key of the missing object
        key: String,
    },

    /// Topology snapshot construction error
    #[error(transparent)]
    Topology(#[from] crate::topology::TopologyError),

    /// Placement planning error
    #[error("placement: {0}")]
    Pack(#[from] crate::pack::PlanError),

    /// Funding planning error
    #[error("funding: {0}")]
    Cover(#[from] crate::cover::PlanError),

    /// Reservation forecasting error
    #[error(transparent)]
    Forecast(#[from] crate::forecast::ForecastError),

    /// Deficit resolution error
    #[error(transparent)]
    Resolver(#[from] crate::resolver::ResolveError),

    /// Binding error (plan/cover mismatch; not normally reachable)
    #[error(transparent)]
    Binding(#[from] crate::binder::BindError),

    /// State persistence I/O error
    #[error("state i/o: {0}")]
    Io(#[from] std::io::Error),

    /// State snapshot encode/decode error
    #[error("state serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "activation")
        context: String,
    },
}

impl Error {
    /// Create a validation error without object context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: "unknown".to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors require a config fix and are not
    /// retryable. Admission failures that the forecaster absorbs never reach
    /// this level; what does (exhausted lotteries, internal errors) is worth
    /// retrying on a later sweep.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::Topology(_) => false,
            Error::Pack(_) | Error::Cover(_) => false,
            Error::Forecast(_) => false,
            Error::Resolver(_) => true,
            Error::Binding(_) => false,
            Error::Io(_) => true,
            Error::Serialization(_) => false,
            Error::Internal { .. } => true,
        }
    }
}
