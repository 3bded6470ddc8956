//! Recipes: declarative rules reacting to storage changes of one app with
//! chained calls and reads on other apps.

mod definition;
mod engine;
mod store;
mod template;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use definition::{
    ActionDefinition, CallAction, OperationAction, RecipeDefinition, RecipeId, RecipeSelect,
    RecipeTriggers,
};
pub use engine::RecipeEngine;
pub use store::{InMemoryRecipeStore, RecipeStore, StoredRecipe};
pub use template::{evaluate_template, RecipeContext};

#[cfg(feature = "persistent")]
pub use persistent::{FileRecipeStore, PersistentRecipeConfig};
