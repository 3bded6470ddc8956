//! Change descriptors.
//!
//! A mutation is described twice: before it executes ([`PreChange`]) and after
//! ([`PostChange`]). Post-phase descriptors are built only from the executed
//! operation's result and the pre-phase descriptor; storage is never read
//! again to build them. [`StorageChange`] is the merged form carried by
//! `storage-change` events.

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};
use crate::object_match::Record;
use crate::storage::PrimaryKey;

/// Change known before the mutation executes.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreChange {
    Create {
        collection: String,
        values: Record,
    },
    Modify {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
        updates: Record,
        pks: Vec<PrimaryKey>,
    },
    Delete {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
        pks: Vec<PrimaryKey>,
    },
}

/// Change known after the mutation executed.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostChange {
    Create {
        collection: String,
        pk: PrimaryKey,
        values: Record,
    },
    Modify {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
        updates: Record,
    },
    Delete {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
    },
}

/// Event-level change descriptor.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageChange {
    Create {
        collection: String,
        pk: PrimaryKey,
        values: Record,
    },
    Modify {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
        updates: Record,
        pks: Vec<PrimaryKey>,
    },
    Delete {
        collection: String,
        #[serde(rename = "where")]
        filter: Record,
        pks: Vec<PrimaryKey>,
    },
}

impl StorageChange {
    /// Collection the change applies to.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Create { collection, .. }
            | Self::Modify { collection, .. }
            | Self::Delete { collection, .. } => collection,
        }
    }

    /// Merges the two phases of one mutation.
    ///
    /// # Errors
    /// Returns an internal error if the phases describe different change kinds.
    pub fn from_phases(pre: &PreChange, post: &PostChange) -> HubResult<Self> {
        match (pre, post) {
            (PreChange::Create { .. }, PostChange::Create { collection, pk, values }) => {
                Ok(Self::Create {
                    collection: collection.clone(),
                    pk: pk.clone(),
                    values: values.clone(),
                })
            }
            (
                PreChange::Modify { pks, .. },
                PostChange::Modify {
                    collection,
                    filter,
                    updates,
                },
            ) => Ok(Self::Modify {
                collection: collection.clone(),
                filter: filter.clone(),
                updates: updates.clone(),
                pks: pks.clone(),
            }),
            (PreChange::Delete { pks, .. }, PostChange::Delete { collection, filter }) => {
                Ok(Self::Delete {
                    collection: collection.clone(),
                    filter: filter.clone(),
                    pks: pks.clone(),
                })
            }
            _ => Err(HubError::internal(format!(
                "change phase mismatch: pre={pre:?} post={post:?}"
            ))),
        }
    }
}

/// An ordered list of changes produced by one storage call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeInfo<C> {
    /// Changes in execution order.
    pub changes: Vec<C>,
}

impl<C> ChangeInfo<C> {
    /// Wraps a change list.
    #[must_use]
    pub const fn new(changes: Vec<C>) -> Self {
        Self { changes }
    }

    /// Returns true when no change was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl<C> Default for ChangeInfo<C> {
    fn default() -> Self {
        Self { changes: Vec::new() }
    }
}

/// Pre-phase change list.
pub type PreChangeInfo = ChangeInfo<PreChange>;
/// Post-phase change list.
pub type PostChangeInfo = ChangeInfo<PostChange>;
/// Change list carried by `storage-change` events.
pub type StorageChangeInfo = ChangeInfo<StorageChange>;

impl StorageChangeInfo {
    /// Merges pre- and post-phase lists pairwise.
    ///
    /// # Errors
    /// Returns an internal error if the lists differ in length or kind.
    pub fn from_phases(pre: &PreChangeInfo, post: &PostChangeInfo) -> HubResult<Self> {
        if pre.changes.len() != post.changes.len() {
            return Err(HubError::internal(format!(
                "change phase length mismatch: pre={} post={}",
                pre.changes.len(),
                post.changes.len()
            )));
        }
        let changes = pre
            .changes
            .iter()
            .zip(&post.changes)
            .map(|(a, b)| StorageChange::from_phases(a, b))
            .collect::<HubResult<Vec<_>>>()?;
        Ok(Self { changes })
    }

    /// Keeps only changes in the given collections.
    #[must_use]
    pub fn retain_collections(&self, collections: &[String]) -> Self {
        Self {
            changes: self
                .changes
                .iter()
                .filter(|c| collections.iter().any(|name| name == c.collection()))
                .cloned()
                .collect(),
        }
    }
}
