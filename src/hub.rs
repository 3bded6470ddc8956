//! The hub broker.
//!
//! A [`Hub`] owns the remote session registry, the event bus and the recipe
//! engine for one process. Components share these through handles; nothing
//! is global.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::app::validate_identifier;
use crate::change_watch::{
    ChangeObserver, ChangeWatchMiddleware, PostChangeInfo, PreChangeInfo, StorageChangeInfo,
    WatchedStorage,
};
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::events::{AppEvent, AppEventBus};
use crate::recipes::{RecipeEngine, RecipeStore};
use crate::remote::RemoteSessionRegistry;
use crate::session::HubSession;
use crate::storage::{ObjectStorage, Operation};

/// Owner of all hub-wide state.
pub struct Hub {
    config: HubConfig,
    registry: Arc<RemoteSessionRegistry>,
    bus: Arc<AppEventBus>,
    recipes: RecipeEngine,
}

impl Hub {
    /// Validates `config`, then builds the registry, the bus and the recipe
    /// engine, loading every recipe in `store`.
    ///
    /// # Errors
    /// Fails on invalid configuration or if stored recipes cannot be read.
    pub fn new(config: HubConfig, store: Arc<dyn RecipeStore>) -> HubResult<Self> {
        let config = config.validate()?;
        let registry = Arc::new(RemoteSessionRegistry::new());
        let bus = Arc::new(AppEventBus::new(Arc::clone(&registry), &config.event_bus));
        let recipes = RecipeEngine::start(
            Arc::clone(&registry),
            Arc::clone(&bus),
            store,
            &config.recipes,
        )?;
        info!(
            dispatch_queue_capacity = config.event_bus.dispatch_queue_capacity,
            reaction_workers = config.recipes.reaction_workers,
            "hub started"
        );
        Ok(Self {
            config,
            registry,
            bus,
            recipes,
        })
    }

    /// Opens a session for one connection.
    #[must_use]
    pub fn open_session(self: &Arc<Self>) -> HubSession {
        HubSession::new(Arc::clone(self))
    }

    /// Wraps an app's storage so its mutations are published as
    /// `storage-change` events. Listeners run before `execute` returns.
    ///
    /// # Errors
    /// Rejects an invalid app identifier.
    pub fn watch_storage<S: ObjectStorage>(
        &self,
        app: &str,
        storage: S,
    ) -> HubResult<WatchedStorage<S>> {
        validate_identifier("app", app)?;
        let observer = ChangePublisher {
            app: app.to_string(),
            bus: Arc::clone(&self.bus),
        };
        Ok(WatchedStorage::new(
            storage,
            ChangeWatchMiddleware::new(Arc::new(observer)),
        ))
    }

    /// The effective configuration.
    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Remote sessions.
    #[must_use]
    pub const fn registry(&self) -> &Arc<RemoteSessionRegistry> {
        &self.registry
    }

    /// Event bus.
    #[must_use]
    pub const fn bus(&self) -> &Arc<AppEventBus> {
        &self.bus
    }

    /// Recipe engine.
    #[must_use]
    pub const fn recipes(&self) -> &RecipeEngine {
        &self.recipes
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.config)
            .field("bus", &self.bus)
            .field("recipes", &self.recipes)
            .finish_non_exhaustive()
    }
}

/// Publishes watched mutations of one app on the bus.
struct ChangePublisher {
    app: String,
    bus: Arc<AppEventBus>,
}

impl ChangeObserver for ChangePublisher {
    fn postprocess(
        &self,
        operation: &Operation,
        info: &PostChangeInfo,
        pre: &PreChangeInfo,
    ) -> HubResult<()> {
        let info = StorageChangeInfo::from_phases(pre, info)?;
        if info.is_empty() {
            debug!(app = %self.app, operation = %operation.kind(), "no changes to publish");
            return Ok(());
        }
        self.bus.emit_awaited(&AppEvent::StorageChange {
            app: self.app.clone(),
            info,
        })
    }
}
