//! Hub configuration.
//!
//! All structs deserialize with defaults for missing fields so a host can
//! embed them in its own configuration file.

use serde::{Deserialize, Serialize};

use crate::app::validate_identifier;
use crate::error::{HubError, HubResult, ValidationError};

/// App event bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Max queued fire-and-forget emissions before events are dropped.
    pub dispatch_queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            dispatch_queue_capacity: 4096,
        }
    }
}

impl EventBusConfig {
    /// Validates the configuration.
    pub fn validate(self) -> HubResult<Self> {
        if self.dispatch_queue_capacity == 0 {
            return Err(invalid("dispatch_queue_capacity must be at least 1"));
        }
        Ok(self)
    }
}

/// Recipe engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeEngineConfig {
    /// Worker threads running recipe reactions.
    pub reaction_workers: usize,
    /// Max queued reactions before new ones are dropped.
    pub reaction_queue_capacity: usize,
    /// Identifier the engine registers itself under as a remote app.
    pub engine_app_identifier: String,
}

impl Default for RecipeEngineConfig {
    fn default() -> Self {
        Self {
            reaction_workers: 2,
            reaction_queue_capacity: 1024,
            engine_app_identifier: "apphub.recipes".to_string(),
        }
    }
}

impl RecipeEngineConfig {
    /// Validates the configuration.
    pub fn validate(self) -> HubResult<Self> {
        if self.reaction_workers == 0 {
            return Err(invalid("reaction_workers must be at least 1"));
        }
        if self.reaction_queue_capacity == 0 {
            return Err(invalid("reaction_queue_capacity must be at least 1"));
        }
        validate_identifier("engine_app_identifier", &self.engine_app_identifier)?;
        Ok(self)
    }
}

/// Top-level hub configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub event_bus: EventBusConfig,
    pub recipes: RecipeEngineConfig,
}

impl HubConfig {
    /// Validates every section.
    pub fn validate(self) -> HubResult<Self> {
        Ok(Self {
            event_bus: self.event_bus.validate()?,
            recipes: self.recipes.validate()?,
        })
    }
}

fn invalid(reason: &str) -> HubError {
    HubError::Validation(ValidationError::InvalidConfig {
        reason: reason.to_string(),
    })
}
