//! Recipe definitions.
//!
//! A recipe binds a change selector on one app to lists of chained actions on
//! other apps. Definitions are stored verbatim as JSON documents.

use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::app::validate_identifier;
use crate::error::{HubError, HubResult, ValidationError};
use crate::object_match::{validate_object_filter, Record};
use crate::storage::{Operation, OperationKind, PrimaryKeySpec};

/// Namespace for content-derived recipe ids.
const RECIPE_NAMESPACE: Uuid = Uuid::from_u128(0x6d1c_9a57_3f0e_4b8a_9c2d_55e1_a7b4_0f13);

/// Content-derived recipe identifier.
///
/// Identical definitions always get the same id.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeId(Uuid);

impl RecipeId {
    /// Derives the id of a definition from its canonical JSON form.
    pub fn for_definition(definition: &RecipeDefinition) -> HubResult<Self> {
        // Going through `Value` sorts object keys.
        let canonical = serde_json::to_value(definition)
            .and_then(|v| serde_json::to_vec(&v))
            .map_err(|e| HubError::internal(format!("recipe serialization failed: {e}")))?;
        let mut hasher = Hasher::new();
        hasher.update(&canonical);
        Ok(Self(Uuid::new_v5(&RECIPE_NAMESPACE, hasher.finalize().as_bytes())))
    }
}

impl fmt::Display for RecipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A declarative rule.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeDefinition {
    pub select: RecipeSelect,
    #[serde(default)]
    pub on: RecipeTriggers,
}

/// Which changes a recipe reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeSelect {
    /// Context name the matched record is bound to.
    pub placeholder: String,
    /// Source app.
    pub app: String,
    /// Source collection.
    pub collection: String,
    /// Filter applied to created records.
    #[serde(rename = "where", default)]
    pub filter: Record,
    /// How to spread a created record's primary key back into named fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk: Option<PrimaryKeySpec>,
}

/// Action lists per change type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeTriggers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<ActionDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modify: Vec<ActionDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<ActionDefinition>,
}

impl RecipeTriggers {
    fn all(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.add.iter().chain(&self.modify).chain(&self.remove)
    }
}

/// One step of a recipe reaction.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionDefinition {
    Call(CallAction),
    Operation(OperationAction),
}

impl ActionDefinition {
    /// Target app.
    #[must_use]
    pub fn app(&self) -> &str {
        match self {
            Self::Call(action) => &action.app,
            Self::Operation(action) => &action.app,
        }
    }

    /// Placeholder the action's result is bound to, if any.
    #[must_use]
    pub fn placeholder(&self) -> Option<&str> {
        match self {
            Self::Call(action) => action.placeholder.as_deref(),
            Self::Operation(action) => action.placeholder.as_deref(),
        }
    }
}

/// Invokes `handleRemoteCall` on an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAction {
    /// Target app.
    pub app: String,
    /// Call name.
    pub call: String,
    /// Argument template.
    #[serde(default)]
    pub args: Value,
    /// Binds the call result for later actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

/// Reads from an app through `handleRemoteOperation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationAction {
    /// Target app.
    pub app: String,
    /// `findObject` or `findObjects`.
    pub operation: String,
    /// Collection to read.
    pub collection: String,
    /// Filter template.
    #[serde(rename = "where", default)]
    pub filter: Value,
    /// Binds the read result for later actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

impl OperationAction {
    /// Parses the operation name. Only reads are permitted.
    pub fn kind(&self) -> HubResult<OperationKind> {
        match self.operation.as_str() {
            "findObject" => Ok(OperationKind::FindObject),
            "findObjects" => Ok(OperationKind::FindObjects),
            other => Err(ValidationError::UnsupportedOperation {
                operation: other.to_string(),
            }
            .into()),
        }
    }

    /// Builds the read operation from an evaluated filter.
    pub fn to_operation(&self, filter: Value) -> HubResult<Operation> {
        let filter = match filter {
            Value::Object(filter) => filter,
            Value::Null => Record::new(),
            _ => {
                return Err(ValidationError::InvalidRecipe {
                    reason: format!(
                        "'where' of {} on {} must be an object",
                        self.operation, self.app
                    ),
                }
                .into())
            }
        };
        let collection = self.collection.clone();
        Ok(match self.kind()? {
            OperationKind::FindObject => Operation::FindObject { collection, filter },
            _ => Operation::FindObjects { collection, filter },
        })
    }
}

impl RecipeDefinition {
    /// Checks names, the selector filter and action kinds.
    pub fn validate(&self) -> HubResult<()> {
        let select = &self.select;
        validate_identifier("select.placeholder", &select.placeholder)?;
        validate_identifier("select.app", &select.app)?;
        validate_identifier("select.collection", &select.collection)?;
        let validation = validate_object_filter(&select.filter);
        if !validation.is_valid() {
            return Err(ValidationError::InvalidFilter(validation).into());
        }
        if let Some(PrimaryKeySpec::Compound(fields)) = &select.pk {
            if fields.is_empty() {
                return Err(ValidationError::InvalidRecipe {
                    reason: "select.pk must name at least one field".to_string(),
                }
                .into());
            }
        }

        for action in self.on.all() {
            validate_identifier("action.app", action.app())?;
            if let Some(placeholder) = action.placeholder() {
                validate_identifier("action.placeholder", placeholder)?;
            }
            match action {
                ActionDefinition::Call(call) => {
                    if call.call.is_empty() {
                        return Err(ValidationError::MissingField {
                            field: "action.call".to_string(),
                        }
                        .into());
                    }
                }
                ActionDefinition::Operation(op) => {
                    op.kind()?;
                    validate_identifier("action.collection", &op.collection)?;
                }
            }
        }
        Ok(())
    }
}
