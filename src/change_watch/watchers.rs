//! Per-operation change watchers.
//!
//! A watcher is a pair of plain functions: one describing the change before
//! the operation runs, one describing it afterwards. There is exactly one
//! watcher per operation kind; kinds without a watcher pass through.

use std::collections::HashMap;
use std::fmt;
use std::slice;

use crate::error::{HubError, HubResult};
use crate::object_match::Record;
use crate::storage::{ObjectStorage, Operation, OperationKind, OperationResult, PrimaryKey};

use super::changes::{PostChange, PreChange};

/// Describes an operation before it executes.
///
/// Receives the downstream storage so key lookups can happen ahead of the
/// mutation.
pub type BeforeFn = fn(&Operation, &dyn ObjectStorage) -> HubResult<Vec<PreChange>>;

/// Describes an executed operation from its result and the pre-phase changes.
pub type AfterFn = fn(&Operation, &OperationResult, &[PreChange]) -> HubResult<Vec<PostChange>>;

/// Extraction rules for one operation kind.
#[allow(missing_docs)]
#[derive(Clone, Copy)]
pub struct ChangeWatcher {
    pub before: BeforeFn,
    pub after: AfterFn,
}

/// Watchers keyed by operation kind.
#[derive(Clone)]
pub struct WatcherTable {
    watchers: HashMap<OperationKind, ChangeWatcher>,
}

impl fmt::Debug for WatcherTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.watchers.keys()).finish()
    }
}

impl WatcherTable {
    /// An empty table: every operation passes through.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            watchers: HashMap::new(),
        }
    }

    /// Watchers for create, update-by-filter, delete-by-filter and batch.
    #[must_use]
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.insert(
            OperationKind::CreateObject,
            ChangeWatcher {
                before: create_before,
                after: single_after,
            },
        );
        table.insert(
            OperationKind::UpdateObjects,
            ChangeWatcher {
                before: update_before,
                after: single_after,
            },
        );
        table.insert(
            OperationKind::DeleteObjects,
            ChangeWatcher {
                before: delete_before,
                after: single_after,
            },
        );
        table.insert(
            OperationKind::ExecuteBatch,
            ChangeWatcher {
                before: batch_before,
                after: single_after,
            },
        );
        table
    }

    /// Installs a watcher, returning the one it replaced.
    pub fn insert(&mut self, kind: OperationKind, watcher: ChangeWatcher) -> Option<ChangeWatcher> {
        self.watchers.insert(kind, watcher)
    }

    /// Removes the watcher for a kind.
    pub fn remove(&mut self, kind: OperationKind) -> Option<ChangeWatcher> {
        self.watchers.remove(&kind)
    }

    /// Looks up the watcher for a kind.
    #[must_use]
    pub fn get(&self, kind: OperationKind) -> Option<&ChangeWatcher> {
        self.watchers.get(&kind)
    }
}

impl Default for WatcherTable {
    fn default() -> Self {
        Self::standard()
    }
}

fn affected_pks(
    storage: &dyn ObjectStorage,
    collection: &str,
    filter: &Record,
) -> HubResult<Vec<PrimaryKey>> {
    let pk = storage.primary_key(collection)?;
    let found = storage.execute(Operation::FindObjects {
        collection: collection.to_string(),
        filter: filter.clone(),
    })?;
    match found {
        OperationResult::Objects(objects) => Ok(objects.iter().map(|o| pk.extract(o)).collect()),
        other => Err(HubError::internal(format!(
            "findObjects returned unexpected result: {other:?}"
        ))),
    }
}

fn create_before(op: &Operation, _storage: &dyn ObjectStorage) -> HubResult<Vec<PreChange>> {
    let Operation::CreateObject { collection, values } = op else {
        return Err(unexpected("createObject", op));
    };
    Ok(vec![PreChange::Create {
        collection: collection.clone(),
        values: values.clone(),
    }])
}

fn update_before(op: &Operation, storage: &dyn ObjectStorage) -> HubResult<Vec<PreChange>> {
    let Operation::UpdateObjects {
        collection,
        filter,
        updates,
    } = op
    else {
        return Err(unexpected("updateObjects", op));
    };
    Ok(vec![PreChange::Modify {
        collection: collection.clone(),
        filter: filter.clone(),
        updates: updates.clone(),
        pks: affected_pks(storage, collection, filter)?,
    }])
}

fn delete_before(op: &Operation, storage: &dyn ObjectStorage) -> HubResult<Vec<PreChange>> {
    let Operation::DeleteObjects { collection, filter } = op else {
        return Err(unexpected("deleteObjects", op));
    };
    Ok(vec![PreChange::Delete {
        collection: collection.clone(),
        filter: filter.clone(),
        pks: affected_pks(storage, collection, filter)?,
    }])
}

/// A batch is described as the concatenation of its sub-operations, in order.
fn batch_before(op: &Operation, storage: &dyn ObjectStorage) -> HubResult<Vec<PreChange>> {
    let Operation::ExecuteBatch { operations } = op else {
        return Err(unexpected("executeBatch", op));
    };
    let mut changes = Vec::new();
    for sub in operations {
        let described = match sub {
            Operation::CreateObject { .. } => create_before(sub, storage)?,
            Operation::UpdateObjects { .. } => update_before(sub, storage)?,
            Operation::DeleteObjects { .. } => delete_before(sub, storage)?,
            Operation::ExecuteBatch { .. } => batch_before(sub, storage)?,
            Operation::FindObject { .. } | Operation::FindObjects { .. } => Vec::new(),
        };
        changes.extend(described);
    }
    Ok(changes)
}

fn single_after(
    op: &Operation,
    result: &OperationResult,
    pre: &[PreChange],
) -> HubResult<Vec<PostChange>> {
    let mut remaining = pre.iter();
    let changes = describe_after(op, result, &mut remaining)?;
    if remaining.next().is_some() {
        return Err(HubError::internal(format!(
            "{} left unconsumed pre-phase changes",
            op.kind()
        )));
    }
    Ok(changes)
}

fn describe_after(
    op: &Operation,
    result: &OperationResult,
    pre: &mut slice::Iter<'_, PreChange>,
) -> HubResult<Vec<PostChange>> {
    match (op, result) {
        (Operation::FindObject { .. } | Operation::FindObjects { .. }, _) => Ok(Vec::new()),
        (Operation::CreateObject { collection, values }, OperationResult::Created { pk, .. }) => {
            take_pre(op, pre)?;
            Ok(vec![PostChange::Create {
                collection: collection.clone(),
                pk: pk.clone(),
                values: values.clone(),
            }])
        }
        (
            Operation::UpdateObjects {
                collection,
                filter,
                updates,
            },
            OperationResult::Updated { .. },
        ) => {
            take_pre(op, pre)?;
            Ok(vec![PostChange::Modify {
                collection: collection.clone(),
                filter: filter.clone(),
                updates: updates.clone(),
            }])
        }
        (Operation::DeleteObjects { collection, filter }, OperationResult::Deleted { .. }) => {
            take_pre(op, pre)?;
            Ok(vec![PostChange::Delete {
                collection: collection.clone(),
                filter: filter.clone(),
            }])
        }
        (Operation::ExecuteBatch { operations }, OperationResult::Batch(results))
            if operations.len() == results.len() =>
        {
            let mut changes = Vec::new();
            for (sub, sub_result) in operations.iter().zip(results) {
                changes.extend(describe_after(sub, sub_result, pre)?);
            }
            Ok(changes)
        }
        _ => Err(HubError::internal(format!(
            "{} produced mismatched result: {result:?}",
            op.kind()
        ))),
    }
}

fn take_pre<'a>(op: &Operation, pre: &mut slice::Iter<'a, PreChange>) -> HubResult<&'a PreChange> {
    pre.next().ok_or_else(|| {
        HubError::internal(format!("{} has no matching pre-phase change", op.kind()))
    })
}

fn unexpected(expected: &str, op: &Operation) -> HubError {
    HubError::internal(format!("{expected} watcher invoked for {}", op.kind()))
}
