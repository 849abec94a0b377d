//! Error types for identity reconciliation.
//!
//! All errors are strongly typed using thiserror so callers can pattern
//! match on the condition instead of parsing messages.

use thiserror::Error;

use crate::contact::ContactId;
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Request must carry a non-empty email or phoneNumber")]
    MissingIdentifier,

    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },
}

/// Execution errors that occur while resolving an identity.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },

    #[error("Cluster rooted at {primary_id} is inconsistent: {reason}")]
    InconsistentCluster {
        primary_id: ContactId,
        reason: String,
    },
}

/// Top-level error type for the crate.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for ReconcileError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::from(err))
    }
}

impl ReconcileError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the caller sent a bad request.
    ///
    /// Everything else is a server-side failure whose cause must not be
    /// echoed back to the caller.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(ValidationError::MissingIdentifier))
    }
}

/// Result type alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
