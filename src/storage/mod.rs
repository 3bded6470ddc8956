//! Storage collaborator boundary.
//!
//! The hub does not own app storage. This module defines the operation type
//! the rest of the crate speaks, the backend trait, and an in-memory backend
//! for embedding and tests.

mod memory;
mod operation;
mod traits;

pub use memory::InMemoryObjectStorage;
pub use operation::{Operation, OperationKind, OperationResult, PrimaryKey, PrimaryKeySpec};
pub use traits::{ObjectStorage, StorageError};
