//! Recipe persistence.
//!
//! The engine loads every stored recipe once at setup and saves each newly
//! created one. Stores keep definitions verbatim; there is no migration.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

use super::definition::{RecipeDefinition, RecipeId};

/// A persisted recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecipe {
    /// Content-derived id.
    pub id: RecipeId,
    /// The definition as submitted.
    pub definition: RecipeDefinition,
    /// When the recipe was first created.
    pub created_at: DateTime<Utc>,
}

/// Storage for recipe definitions.
pub trait RecipeStore: Send + Sync {
    /// Every stored recipe, in creation order.
    fn load_all(&self) -> Result<Vec<StoredRecipe>, StorageError>;

    /// Stores a recipe. Saving an id that already exists is a no-op.
    fn save(&self, recipe: &StoredRecipe) -> Result<(), StorageError>;
}

impl<T: RecipeStore + ?Sized> RecipeStore for Arc<T> {
    fn load_all(&self) -> Result<Vec<StoredRecipe>, StorageError> {
        (**self).load_all()
    }

    fn save(&self, recipe: &StoredRecipe) -> Result<(), StorageError> {
        (**self).save(recipe)
    }
}

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Volatile [`RecipeStore`].
#[derive(Debug, Default)]
pub struct InMemoryRecipeStore {
    recipes: RwLock<BTreeMap<u64, StoredRecipe>>,
}

impl InMemoryRecipeStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecipeStore for InMemoryRecipeStore {
    fn load_all(&self) -> Result<Vec<StoredRecipe>, StorageError> {
        let guard = self.recipes.read().map_err(|_| lock_err("recipes.read"))?;
        Ok(guard.values().cloned().collect())
    }

    fn save(&self, recipe: &StoredRecipe) -> Result<(), StorageError> {
        let mut guard = self.recipes.write().map_err(|_| lock_err("recipes.write"))?;
        if guard.values().any(|r| r.id == recipe.id) {
            return Ok(());
        }
        let seq = guard.keys().next_back().map_or(0, |k| k + 1);
        guard.insert(seq, recipe.clone());
        Ok(())
    }
}
