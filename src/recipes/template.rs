//! Recipe context and action templates.
//!
//! A template is plain JSON in which any object of the exact shape
//! `{"$logic": "$name.path.segments"}` is replaced by a lookup into the
//! context. Every other value passes through unchanged. Evaluation is pure.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{HubResult, ValidationError};

const LOGIC_KEY: &str = "$logic";

/// Placeholder bindings for one reaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipeContext {
    bindings: HashMap<String, Value>,
}

impl RecipeContext {
    /// An empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context with a single binding.
    #[must_use]
    pub fn seeded(placeholder: &str, value: Value) -> Self {
        let mut ctx = Self::new();
        ctx.bind(placeholder, value);
        ctx
    }

    /// Binds (or rebinds) a placeholder.
    pub fn bind(&mut self, placeholder: &str, value: Value) {
        self.bindings.insert(placeholder.to_string(), value);
    }

    /// Looks up a placeholder.
    #[must_use]
    pub fn get(&self, placeholder: &str) -> Option<&Value> {
        self.bindings.get(placeholder)
    }

    /// Resolves a `$name.path` reference.
    ///
    /// Path segments index objects by key and arrays by position. A segment
    /// that does not resolve yields `null`.
    ///
    /// # Errors
    /// Fails when the reference does not start with `$` or names an unbound
    /// placeholder.
    pub fn resolve(&self, reference: &str) -> HubResult<Value> {
        let Some(path) = reference.strip_prefix('$') else {
            return Err(ValidationError::InvalidRecipe {
                reason: format!("unsupported {LOGIC_KEY} expression: {reference:?}"),
            }
            .into());
        };
        let mut segments = path.split('.');
        let name = segments.next().unwrap_or_default();
        let root = self.get(name).ok_or_else(|| ValidationError::UnknownPlaceholder {
            name: name.to_string(),
        })?;

        let mut current = root;
        for segment in segments {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Value::Null),
            }
        }
        Ok(current.clone())
    }
}

/// Evaluates a template against a context.
pub fn evaluate_template(template: &Value, ctx: &RecipeContext) -> HubResult<Value> {
    match template {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(reference)) = map.get(LOGIC_KEY) {
                    return ctx.resolve(reference);
                }
            }
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), evaluate_template(value, ctx)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_template(item, ctx))
            .collect::<HubResult<Vec<_>>>()
            .map(Value::Array),
        literal => Ok(literal.clone()),
    }
}
