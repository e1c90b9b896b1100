//! Error types for container lifecycle and attach operations.

use crate::backend::Fault;
use crate::trace::Cause;

/// Result type alias for magikcell operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while staging, committing, or attaching to containers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// The container has no backing VM yet (or the backend cannot see it).
    #[error("{id} is not completely created")]
    NotYetExist { id: String },

    /// Commit rejected because the backend changed since the handle was staged.
    #[error("concurrent modification of container '{id}': {detail}")]
    ConcurrentAccess { id: String, detail: String },

    /// Remove rejected because the container is powered on.
    #[error("container '{id}' is powered on and cannot be removed")]
    RemovePower { id: String },

    /// Container not found.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Unknown target state name.
    #[error("invalid container state: {0}")]
    InvalidState(String),

    /// Requested state change is not part of the lifecycle graph.
    #[error("container '{id}' cannot transition from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Hard power off failed after graceful shutdown was exhausted.
    #[error("failed to stop container '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// Graceful shutdown exhausted every stop signal.
    #[error("failed to shutdown {id} via kill signals {signals:?}")]
    ShutdownFailed { id: String, signals: Vec<String> },

    /// Signal delivery failed.
    #[error("failed to send signal to container '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// The virtualization backend reported a fault.
    #[error("{operation} failed: {fault}")]
    Backend { operation: String, fault: Fault },

    // =========================================================================
    // Attach Errors
    // =========================================================================
    /// Non-blocking connector lookup missed.
    #[error("no such connection: {0}")]
    NoSuchConnection(String),

    /// Blocking connector lookup gave up.
    #[error("attach connector: connection not found error for id:{id}: {cause}")]
    ConnectionNotFound { id: String, cause: Cause },

    /// Multiplexed session layer failed.
    #[error("session error: {0}")]
    Session(String),

    // =========================================================================
    // Bounded Waits
    // =========================================================================
    /// Operation cancelled by its caller.
    #[error("{operation}: {cause}")]
    Cancelled { operation: String, cause: Cause },

    // =========================================================================
    // Configuration / Input Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid caller input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wraps a backend fault with the operation that produced it.
    pub fn backend(operation: impl Into<String>, fault: Fault) -> Self {
        Self::Backend {
            operation: operation.into(),
            fault,
        }
    }

    /// True for errors the API layer reports as a conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentAccess { .. } | Self::RemovePower { .. }
        )
    }

    /// True for errors the API layer reports as not found.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::NoSuchConnection(_) | Self::ConnectionNotFound { .. }
        )
    }

    /// True if the error came from a bounded wait expiring.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Cancelled { cause, .. } | Self::ConnectionNotFound { cause, .. } => {
                *cause == Cause::DeadlineExceeded
            }
            Self::Backend { fault, .. } => matches!(fault, Fault::Timeout),
            _ => false,
        }
    }
}
