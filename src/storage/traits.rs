//! Abstract storage trait for the hub.
//!
//! The hub treats per-app storage as an external collaborator with a single
//! mutation entry point. Implementations decide the backend; the change-watch
//! middleware only wraps calls to it.

use std::sync::Arc;

use thiserror::Error;

use super::operation::{Operation, OperationResult, PrimaryKeySpec};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Collection not registered.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Operation arguments are unusable for this backend.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Storage backend for one app's collections.
///
/// # Safety Considerations
/// - Each call to `execute` should be atomic for non-batch operations
/// - Implementations should handle concurrent access safely
pub trait ObjectStorage: Send + Sync {
    /// Executes a single operation.
    fn execute(&self, operation: Operation) -> Result<OperationResult, StorageError>;

    /// Primary key layout of a collection.
    fn primary_key(&self, collection: &str) -> Result<PrimaryKeySpec, StorageError>;
}

impl<T: ObjectStorage + ?Sized> ObjectStorage for Arc<T> {
    fn execute(&self, operation: Operation) -> Result<OperationResult, StorageError> {
        (**self).execute(operation)
    }

    fn primary_key(&self, collection: &str) -> Result<PrimaryKeySpec, StorageError> {
        (**self).primary_key(collection)
    }
}
