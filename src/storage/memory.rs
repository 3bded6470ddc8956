//! In-memory storage backend.
//!
//! Thread-safe reference implementation of [`ObjectStorage`] for embedded
//! usage and tests. Collections must be registered with their primary key
//! layout first. Single-field keys are generated as increasing integers when
//! the created values omit them.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::object_match::{loose_eq, match_object, Record};

use super::operation::{Operation, OperationResult, PrimaryKeySpec};
use super::traits::{ObjectStorage, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug)]
struct CollectionState {
    pk: PrimaryKeySpec,
    next_id: u64,
    objects: Vec<Record>,
}

impl CollectionState {
    fn new(pk: PrimaryKeySpec) -> Self {
        Self {
            pk,
            next_id: 1,
            objects: Vec::new(),
        }
    }

    fn create(
        &mut self,
        collection: &str,
        mut values: Record,
    ) -> Result<OperationResult, StorageError> {
        match &self.pk {
            PrimaryKeySpec::Single(field) => {
                if values.get(field).map_or(true, Value::is_null) {
                    values.insert(field.clone(), Value::from(self.next_id));
                    self.next_id += 1;
                }
            }
            PrimaryKeySpec::Compound(fields) => {
                let missing = fields
                    .iter()
                    .find(|f| values.get(*f).map_or(true, Value::is_null));
                if let Some(missing) = missing {
                    return Err(StorageError::InvalidOperation(format!(
                        "{collection}: compound key field '{missing}' is required"
                    )));
                }
            }
        }

        let pk = self.pk.extract(&values);
        if self.objects.iter().any(|o| loose_eq(&self.pk.extract(o), &pk)) {
            return Err(StorageError::DuplicateKey(format!("{collection}: {pk}")));
        }

        self.objects.push(values.clone());
        Ok(OperationResult::Created { pk, object: values })
    }

    fn update(&mut self, filter: &Record, updates: &Record) -> usize {
        let mut count = 0;
        for object in &mut self.objects {
            if match_object(object, filter).matches {
                for (k, v) in updates {
                    object.insert(k.clone(), v.clone());
                }
                count += 1;
            }
        }
        count
    }

    fn delete(&mut self, filter: &Record) -> usize {
        let before = self.objects.len();
        self.objects.retain(|o| !match_object(o, filter).matches);
        before - self.objects.len()
    }

    fn find<'a>(&'a self, filter: &'a Record) -> impl Iterator<Item = &'a Record> + 'a {
        self.objects.iter().filter(move |o| match_object(o, filter).matches)
    }
}

/// In-memory [`ObjectStorage`].
#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    collections: RwLock<HashMap<String, CollectionState>>,
}

impl InMemoryObjectStorage {
    /// Creates an empty storage with no collections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a collection. Re-registering an existing name is a no-op.
    pub fn register_collection(
        &self,
        name: impl Into<String>,
        pk: PrimaryKeySpec,
    ) -> Result<(), StorageError> {
        let mut guard = self
            .collections
            .write()
            .map_err(|_| lock_err("collections.write"))?;
        guard.entry(name.into()).or_insert_with(|| CollectionState::new(pk));
        Ok(())
    }

    /// Builder-style registration of a collection keyed by an `id` field.
    #[must_use]
    pub fn with_collection(self, name: impl Into<String>) -> Self {
        if let Ok(mut guard) = self.collections.write() {
            guard
                .entry(name.into())
                .or_insert_with(|| CollectionState::new(PrimaryKeySpec::Single("id".to_string())));
        }
        self
    }

    fn execute_one(&self, operation: Operation) -> Result<OperationResult, StorageError> {
        match operation {
            Operation::CreateObject { collection, values } => {
                let mut guard = self
                    .collections
                    .write()
                    .map_err(|_| lock_err("collections.write"))?;
                let state = guard
                    .get_mut(&collection)
                    .ok_or_else(|| StorageError::CollectionNotFound(collection.clone()))?;
                state.create(&collection, values)
            }
            Operation::UpdateObjects {
                collection,
                filter,
                updates,
            } => {
                let mut guard = self
                    .collections
                    .write()
                    .map_err(|_| lock_err("collections.write"))?;
                let state = guard
                    .get_mut(&collection)
                    .ok_or(StorageError::CollectionNotFound(collection))?;
                Ok(OperationResult::Updated {
                    count: state.update(&filter, &updates),
                })
            }
            Operation::DeleteObjects { collection, filter } => {
                let mut guard = self
                    .collections
                    .write()
                    .map_err(|_| lock_err("collections.write"))?;
                let state = guard
                    .get_mut(&collection)
                    .ok_or(StorageError::CollectionNotFound(collection))?;
                Ok(OperationResult::Deleted {
                    count: state.delete(&filter),
                })
            }
            Operation::FindObject { collection, filter } => {
                let guard = self
                    .collections
                    .read()
                    .map_err(|_| lock_err("collections.read"))?;
                let state = guard
                    .get(&collection)
                    .ok_or(StorageError::CollectionNotFound(collection))?;
                let found = state.find(&filter).next().cloned();
                Ok(OperationResult::Object(found))
            }
            Operation::FindObjects { collection, filter } => {
                let guard = self
                    .collections
                    .read()
                    .map_err(|_| lock_err("collections.read"))?;
                let state = guard
                    .get(&collection)
                    .ok_or(StorageError::CollectionNotFound(collection))?;
                let found = state.find(&filter).cloned().collect();
                Ok(OperationResult::Objects(found))
            }
            Operation::ExecuteBatch { operations } => {
                // No rollback: a failing sub-operation leaves earlier ones applied.
                let mut results = Vec::with_capacity(operations.len());
                for op in operations {
                    results.push(self.execute_one(op)?);
                }
                Ok(OperationResult::Batch(results))
            }
        }
    }
}

impl ObjectStorage for InMemoryObjectStorage {
    fn execute(&self, operation: Operation) -> Result<OperationResult, StorageError> {
        self.execute_one(operation)
    }

    fn primary_key(&self, collection: &str) -> Result<PrimaryKeySpec, StorageError> {
        let guard = self
            .collections
            .read()
            .map_err(|_| lock_err("collections.read"))?;
        guard
            .get(collection)
            .map(|state| state.pk.clone())
            .ok_or_else(|| StorageError::CollectionNotFound(collection.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn create_generates_increasing_ids() {
        let storage = InMemoryObjectStorage::new().with_collection("user");
        let first = storage
            .execute(Operation::CreateObject {
                collection: "user".to_string(),
                values: rec(json!({"displayName": "John Doe"})),
            })
            .unwrap();
        let second = storage
            .execute(Operation::CreateObject {
                collection: "user".to_string(),
                values: rec(json!({"displayName": "Jane Doe"})),
            })
            .unwrap();

        assert!(matches!(first, OperationResult::Created { ref pk, .. } if pk == &json!(1)));
        assert!(matches!(second, OperationResult::Created { ref pk, .. } if pk == &json!(2)));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let storage = InMemoryObjectStorage::new().with_collection("user");
        let op = Operation::CreateObject {
            collection: "user".to_string(),
            values: rec(json!({"id": 7})),
        };
        storage.execute(op.clone()).unwrap();
        assert!(matches!(storage.execute(op), Err(StorageError::DuplicateKey(_))));
    }

    #[test]
    fn compound_keys_require_all_fields() {
        let storage = InMemoryObjectStorage::new();
        storage
            .register_collection(
                "membership",
                PrimaryKeySpec::Compound(vec!["user".to_string(), "group".to_string()]),
            )
            .unwrap();

        let missing = storage.execute(Operation::CreateObject {
            collection: "membership".to_string(),
            values: rec(json!({"user": 1})),
        });
        assert!(matches!(missing, Err(StorageError::InvalidOperation(_))));

        let created = storage
            .execute(Operation::CreateObject {
                collection: "membership".to_string(),
                values: rec(json!({"user": 1, "group": "admins"})),
            })
            .unwrap();
        assert!(matches!(
            created,
            OperationResult::Created { ref pk, .. } if pk == &json!([1, "admins"])
        ));
    }

    #[test]
    fn update_and_delete_by_filter() {
        let storage = InMemoryObjectStorage::new().with_collection("note");
        for n in 0..3 {
            storage
                .execute(Operation::CreateObject {
                    collection: "note".to_string(),
                    values: rec(json!({"n": n})),
                })
                .unwrap();
        }

        let updated = storage
            .execute(Operation::UpdateObjects {
                collection: "note".to_string(),
                filter: rec(json!({"n": {"$ge": 1}})),
                updates: rec(json!({"flag": true})),
            })
            .unwrap();
        assert_eq!(updated, OperationResult::Updated { count: 2 });

        let deleted = storage
            .execute(Operation::DeleteObjects {
                collection: "note".to_string(),
                filter: rec(json!({"flag": true})),
            })
            .unwrap();
        assert_eq!(deleted, OperationResult::Deleted { count: 2 });

        let OperationResult::Objects(rest) = storage
            .execute(Operation::FindObjects {
                collection: "note".to_string(),
                filter: Record::new(),
            })
            .unwrap()
        else {
            panic!("expected objects");
        };
        assert_eq!(rest, vec![rec(json!({"n": 0, "id": 1}))]);
    }

    #[test]
    fn find_object_returns_first_match_or_none() {
        let storage = InMemoryObjectStorage::new().with_collection("tag");
        for name in ["share", "archive", "share"] {
            storage
                .execute(Operation::CreateObject {
                    collection: "tag".to_string(),
                    values: rec(json!({"name": name})),
                })
                .unwrap();
        }

        let found = storage
            .execute(Operation::FindObject {
                collection: "tag".to_string(),
                filter: rec(json!({"name": "share"})),
            })
            .unwrap();
        assert_eq!(
            found,
            OperationResult::Object(Some(rec(json!({"name": "share", "id": 1}))))
        );

        let missing = storage
            .execute(Operation::FindObject {
                collection: "tag".to_string(),
                filter: rec(json!({"name": "pinned"})),
            })
            .unwrap();
        assert_eq!(missing, OperationResult::Object(None));
    }

    #[test]
    fn unknown_collection_is_an_error() {
        let storage = InMemoryObjectStorage::new();
        let err = storage.primary_key("missing").unwrap_err();
        assert!(matches!(err, StorageError::CollectionNotFound(_)));
    }
}
