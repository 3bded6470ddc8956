//! Error types for the hub core.
//!
//! All errors are strongly typed using thiserror. Expected steady-state
//! outcomes (a peer being offline, a peer lacking a callback) are NOT errors:
//! they travel as enum values through [`crate::remote::CallbackOutcome`] and the
//! per-callback reply types. Everything in this module indicates a caller or
//! data-integrity defect and aborts the current request.

use thiserror::Error;

use crate::object_match::FilterValidation;
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid identifier for '{field}': {value:?}")]
    InvalidIdentifier {
        field: String,
        value: String,
    },

    #[error("Invalid object filter: {0}")]
    InvalidFilter(FilterValidation),

    #[error("Invalid recipe definition: {reason}")]
    InvalidRecipe {
        reason: String,
    },

    #[error("Unsupported recipe operation: {operation}")]
    UnsupportedOperation {
        operation: String,
    },

    #[error("Unknown placeholder in template: ${name}")]
    UnknownPlaceholder {
        name: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while carrying out a request.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Remote action on app '{app}' failed: {status}")]
    RemoteActionFailed {
        app: String,
        status: String,
    },

    #[error("Listener failed: {message}")]
    ListenerFailed {
        message: String,
    },

    #[error("Lock poisoned: {context}")]
    LockPoisoned {
        context: String,
    },
}

/// Protocol violations: the caller used the API in a way it never supports.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Session is not identified")]
    NotIdentified,

    #[error("Session is already identified as '{identifier}'")]
    AlreadyIdentified {
        identifier: String,
    },

    #[error("Unknown subscription: {subscription_id}")]
    UnknownSubscription {
        subscription_id: String,
    },

    #[error("Event '{event}' is emitted by the hub only")]
    ReservedEvent {
        event: String,
    },

    #[error("Cannot emit events on behalf of app '{app}'")]
    ForeignEvent {
        app: String,
    },
}

/// Top-level error type for the hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for HubError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::Storage {
            message: err.to_string(),
        })
    }
}

impl HubError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a poisoned-lock execution error.
    #[must_use]
    pub fn lock_poisoned(context: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::LockPoisoned {
            context: context.into(),
        })
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

    /// Returns true if this is a protocol violation.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_identifier() {
        let err = ValidationError::InvalidIdentifier {
            field: "collection".to_string(),
            value: "bad name".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("collection"));
        assert!(msg.contains("bad name"));
    }

    #[test]
    fn test_validation_error_filter_message() {
        let err = ValidationError::InvalidFilter(FilterValidation::invalid(
            Some("test"),
            Some("$gt"),
            "should compare with a number",
        ));
        assert!(format!("{err}").contains("should compare with a number"));
    }

    #[test]
    fn test_execution_error_remote_action() {
        let err = ExecutionError::RemoteActionFailed {
            app: "dest".to_string(),
            status: "app-not-found".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("dest"));
        assert!(msg.contains("app-not-found"));
    }

    #[test]
    fn test_protocol_error_unknown_subscription() {
        let err: HubError = ProtocolError::UnknownSubscription {
            subscription_id: "abc".to_string(),
        }
        .into();
        assert!(err.is_protocol());
        assert!(format!("{err}").contains("abc"));
    }

    #[test]
    fn test_storage_error_converts_to_execution() {
        let err: HubError = StorageError::CollectionNotFound("user".to_string()).into();
        assert!(err.is_execution());
        assert!(format!("{err}").contains("user"));
    }

    #[test]
    fn test_hub_error_internal() {
        let internal = HubError::internal("unexpected state");
        assert!(internal.is_internal());
        assert!(!internal.is_execution());
        assert!(format!("{internal}").contains("unexpected state"));
    }
}
