//! Storage operations and their results.
//!
//! Operations are a closed tagged variant rather than positional argument
//! lists. The change-watch middleware and recipe operation actions both
//! produce and consume this type.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::object_match::Record;

/// A primary key: a scalar, or an array of scalars for compound keys.
pub type PrimaryKey = Value;

/// How a collection's primary key is made up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKeySpec {
    /// A single field.
    Single(String),
    /// Several fields, in key order.
    Compound(Vec<String>),
}

impl PrimaryKeySpec {
    /// Reads the primary key out of a stored object.
    ///
    /// Compound keys come back as an array in field order. Missing fields read
    /// as `null`.
    #[must_use]
    pub fn extract(&self, object: &Record) -> PrimaryKey {
        match self {
            Self::Single(field) => object.get(field).cloned().unwrap_or(Value::Null),
            Self::Compound(fields) => Value::Array(
                fields
                    .iter()
                    .map(|f| object.get(f).cloned().unwrap_or(Value::Null))
                    .collect(),
            ),
        }
    }

    /// Field names making up the key.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Single(field) => vec![field.as_str()],
            Self::Compound(fields) => fields.iter().map(String::as_str).collect(),
        }
    }
}

/// Operation discriminant, used to look up change watchers.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateObject,
    UpdateObjects,
    DeleteObjects,
    FindObject,
    FindObjects,
    ExecuteBatch,
}

impl OperationKind {
    /// The operation's wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateObject => "createObject",
            Self::UpdateObjects => "updateObjects",
            Self::DeleteObjects => "deleteObjects",
            Self::FindObject => "findObject",
            Self::FindObjects => "findObjects",
            Self::ExecuteBatch => "executeBatch",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage call.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum Operation {
    CreateObject {
        collection: String,
        values: Record,
    },
    UpdateObjects {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
        updates: Record,
    },
    DeleteObjects {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
    },
    FindObject {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
    },
    FindObjects {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
    },
    /// Sub-operations executed in list order.
    ExecuteBatch {
        operations: Vec<Operation>,
    },
}

impl Operation {
    /// The operation's discriminant.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::CreateObject { .. } => OperationKind::CreateObject,
            Self::UpdateObjects { .. } => OperationKind::UpdateObjects,
            Self::DeleteObjects { .. } => OperationKind::DeleteObjects,
            Self::FindObject { .. } => OperationKind::FindObject,
            Self::FindObjects { .. } => OperationKind::FindObjects,
            Self::ExecuteBatch { .. } => OperationKind::ExecuteBatch,
        }
    }

    /// The collection the operation targets; `None` for batches.
    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::CreateObject { collection, .. }
            | Self::UpdateObjects { collection, .. }
            | Self::DeleteObjects { collection, .. }
            | Self::FindObject { collection, .. }
            | Self::FindObjects { collection, .. } => Some(collection),
            Self::ExecuteBatch { .. } => None,
        }
    }
}

/// Result of executing an [`Operation`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    /// The stored object, including any generated key fields.
    Created { pk: PrimaryKey, object: Record },
    Updated { count: usize },
    Deleted { count: usize },
    Object(Option<Record>),
    Objects(Vec<Record>),
    /// One result per sub-operation, in order.
    Batch(Vec<OperationResult>),
}
