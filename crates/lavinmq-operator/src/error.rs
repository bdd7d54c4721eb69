//! Error types for the LavinMQ Kubernetes Operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Requested volume size is smaller than the stored claim
    #[error("volume size decreased, not supported: {claim} is {current}, requested {requested}")]
    StorageShrink {
        claim: String,
        current: String,
        requested: String,
    },

    /// Storage class of a bound claim cannot change
    #[error("storage class change not supported: {claim} uses {current:?}, requested {requested:?}")]
    StorageClassChange {
        claim: String,
        current: Option<String>,
        requested: Option<String>,
    },

    /// A child resource that must already exist is missing
    #[error("Dependency missing: {kind}/{name}: {reason}")]
    DependencyMissing {
        kind: String,
        name: String,
        reason: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_) | OperatorError::DependencyMissing { .. }
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::DependencyMissing { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    /// Write rejected because the stored object changed since it was read.
    ///
    /// A create racing another create surfaces as 409 AlreadyExists, which
    /// is handled the same way: the next attempt fetches and diffs instead.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    /// Object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}
