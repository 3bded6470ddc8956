//! Recipe engine.
//!
//! The engine joins the hub as a remote app of its own: it subscribes to
//! `storage-change` events of every recipe's source app and to availability
//! changes, and receives them through [`RemoteCallbacks::handle_event`].
//! Deliveries are turned into jobs for a small bounded worker pool, so a
//! storage write never waits on a recipe's actions.
//!
//! One job handles one delivered event. Within a job, changes, primary keys
//! and actions run strictly in order; the first failing action stops the
//! whole job. Different jobs may run concurrently.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::app::{AppId, IdentifiedApp};
use crate::change_watch::{StorageChange, StorageChangeInfo};
use crate::config::RecipeEngineConfig;
use crate::error::{ExecutionError, HubError, HubResult};
use crate::events::{
    AppEvent, AppEventBus, EventDelivery, SubscribeOutcome, SubscriptionId, SubscriptionRequest,
};
use crate::object_match::{match_object, Record};
use crate::remote::{
    CallbackOutcome, DeliveryReply, RemoteCallReply, RemoteCallbacks, RemoteOperationReply,
    RemoteSessionRegistry,
};
use crate::storage::{PrimaryKey, PrimaryKeySpec};

use super::definition::{ActionDefinition, RecipeDefinition, RecipeId};
use super::store::{RecipeStore, StoredRecipe};
use super::template::{evaluate_template, RecipeContext};

/// Registration id the engine identifies itself with.
const ENGINE_APP_ID: AppId = AppId(0);

enum Job {
    React {
        recipe_id: RecipeId,
        info: StorageChangeInfo,
    },
    Resubscribe {
        recipe_id: RecipeId,
    },

    #[cfg(test)]
    Block {
        release: Receiver<()>,
    },
}

#[derive(Debug, Default)]
struct EngineState {
    recipes: HashMap<RecipeId, Arc<RecipeDefinition>>,
    active: HashMap<RecipeId, SubscriptionId>,
    by_subscription: HashMap<SubscriptionId, RecipeId>,
    availability: Option<SubscriptionId>,
}

/// State shared by the engine handle, its callbacks and its workers.
struct EngineCore {
    registry: Arc<RemoteSessionRegistry>,
    bus: Arc<AppEventBus>,
    store: Arc<dyn RecipeStore>,
    identity: IdentifiedApp,
    state: Mutex<EngineState>,
}

struct ReactionPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
    dropped: AtomicU64,
}

struct EngineShared {
    core: Arc<EngineCore>,
    pool: ReactionPool,
}

/// Callbacks the engine registers under its own app identifier.
struct EngineCallbacks {
    shared: Weak<EngineShared>,
}

/// Runs recipes against storage changes of connected apps.
pub struct RecipeEngine {
    shared: Arc<EngineShared>,
}

impl EngineCore {
    fn lock(&self) -> HubResult<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| HubError::lock_poisoned("recipe_engine.state"))
    }

    fn definition(&self, recipe_id: RecipeId) -> HubResult<Option<Arc<RecipeDefinition>>> {
        Ok(self.lock()?.recipes.get(&recipe_id).cloned())
    }

    fn run(&self, job: Job) {
        match job {
            Job::React { recipe_id, info } => {
                let definition = match self.definition(recipe_id) {
                    Ok(Some(definition)) => definition,
                    Ok(None) => {
                        debug!(%recipe_id, "reaction for unknown recipe skipped");
                        return;
                    }
                    Err(err) => {
                        warn!(%recipe_id, error = %err, "recipe lookup failed");
                        return;
                    }
                };
                debug!(%recipe_id, changes = info.changes.len(), "recipe reaction started");
                if let Err(err) = self.react(&definition, &info) {
                    warn!(%recipe_id, error = %err, "recipe reaction failed");
                }
            }
            Job::Resubscribe { recipe_id } => {
                if let Err(err) = self.subscribe(recipe_id) {
                    warn!(%recipe_id, error = %err, "recipe resubscription failed");
                }
            }

            #[cfg(test)]
            Job::Block { release } => {
                let _ = release.recv();
            }
        }
    }

    /// Subscribes a recipe to its source collection, replacing any earlier
    /// subscription it held.
    fn subscribe(&self, recipe_id: RecipeId) -> HubResult<()> {
        let Some(definition) = self.definition(recipe_id)? else {
            return Ok(());
        };
        let select = &definition.select;
        let request = SubscriptionRequest::StorageChange {
            app: select.app.clone(),
            collections: Some(vec![select.collection.clone()]),
        };

        let subscription_id = match self.bus.subscribe_to_event(&self.identity, request)? {
            SubscribeOutcome::Success { subscription_id } => subscription_id,
            outcome => {
                debug!(
                    %recipe_id,
                    source_app = %select.app,
                    status = outcome.status(),
                    "recipe source unavailable; waiting for it"
                );
                return Ok(());
            }
        };

        let previous = {
            let mut state = self.lock()?;
            state.by_subscription.insert(subscription_id, recipe_id);
            let previous = state.active.insert(recipe_id, subscription_id);
            if let Some(previous) = previous {
                state.by_subscription.remove(&previous);
            }
            previous
        };
        info!(
            %recipe_id,
            %subscription_id,
            source_app = %select.app,
            collection = %select.collection,
            "recipe subscribed"
        );

        if let Some(previous) = previous {
            // The old subscription may already be gone with its peer session.
            if let Err(err) = self.bus.unsubscribe_from_event(previous) {
                debug!(
                    %recipe_id,
                    subscription_id = %previous,
                    error = %err,
                    "previous subscription not released"
                );
            }
        }
        Ok(())
    }

    fn react(&self, definition: &RecipeDefinition, info: &StorageChangeInfo) -> HubResult<()> {
        let select = &definition.select;
        let triggers = &definition.on;
        for change in &info.changes {
            if change.collection() != select.collection {
                continue;
            }
            match change {
                StorageChange::Create { pk, values, .. } => {
                    if triggers.add.is_empty() {
                        continue;
                    }
                    let target = match_target(values, pk, select.pk.as_ref());
                    if !match_object(&target, &select.filter).matches {
                        debug!(
                            collection = %select.collection,
                            "created object does not match recipe"
                        );
                        continue;
                    }
                    let ctx = RecipeContext::seeded(
                        &select.placeholder,
                        json!({ "pk": pk, "values": values }),
                    );
                    self.run_actions(&triggers.add, ctx)?;
                }
                StorageChange::Modify { pks, updates, .. } => {
                    if triggers.modify.is_empty() {
                        continue;
                    }
                    for pk in pks {
                        let ctx = RecipeContext::seeded(
                            &select.placeholder,
                            json!({ "pk": pk, "updates": updates }),
                        );
                        self.run_actions(&triggers.modify, ctx)?;
                    }
                }
                StorageChange::Delete { pks, .. } => {
                    if triggers.remove.is_empty() {
                        continue;
                    }
                    for pk in pks {
                        let ctx = RecipeContext::seeded(&select.placeholder, json!({ "pk": pk }));
                        self.run_actions(&triggers.remove, ctx)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn run_actions(&self, actions: &[ActionDefinition], mut ctx: RecipeContext) -> HubResult<()> {
        for action in actions {
            let result = match action {
                ActionDefinition::Call(call) => {
                    let args = evaluate_template(&call.args, &ctx)?;
                    match self.registry.remote_call(&call.app, &call.call, args)? {
                        CallbackOutcome::Success(RemoteCallReply::Success { result }) => result,
                        CallbackOutcome::Success(reply) => {
                            return Err(action_failed(&call.app, reply.status()))
                        }
                        outcome @ CallbackOutcome::AppNotFound => {
                            return Err(action_failed(&call.app, outcome.status()))
                        }
                    }
                }
                ActionDefinition::Operation(op) => {
                    let filter = evaluate_template(&op.filter, &ctx)?;
                    let operation = op.to_operation(filter)?;
                    match self.registry.remote_operation(&op.app, operation, "")? {
                        CallbackOutcome::Success(RemoteOperationReply::Success { result }) => {
                            result
                        }
                        CallbackOutcome::Success(reply) => {
                            return Err(action_failed(&op.app, reply.status()))
                        }
                        outcome @ CallbackOutcome::AppNotFound => {
                            return Err(action_failed(&op.app, outcome.status()))
                        }
                    }
                }
            };
            if let Some(placeholder) = action.placeholder() {
                ctx.bind(placeholder, result);
            }
        }
        Ok(())
    }
}

/// Created values plus the primary key spread over its named fields.
fn match_target(values: &Record, pk: &PrimaryKey, spec: Option<&PrimaryKeySpec>) -> Record {
    let mut target = values.clone();
    match spec {
        Some(PrimaryKeySpec::Single(field)) => {
            target.insert(field.clone(), pk.clone());
        }
        Some(PrimaryKeySpec::Compound(fields)) => {
            if let Value::Array(parts) = pk {
                for (field, part) in fields.iter().zip(parts) {
                    target.insert(field.clone(), part.clone());
                }
            }
        }
        None => {}
    }
    target
}

fn action_failed(app: &str, status: &str) -> HubError {
    ExecutionError::RemoteActionFailed {
        app: app.to_string(),
        status: status.to_string(),
    }
    .into()
}

impl ReactionPool {
    fn start(workers: usize, capacity: usize, core: &Arc<EngineCore>) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (tx, rx) = bounded::<Job>(capacity);

        let handles = (0..workers)
            .map(|idx| {
                let rx: Receiver<Job> = rx.clone();
                let core = Arc::clone(core);
                thread::Builder::new()
                    .name(format!("apphub-recipes-{idx}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            core.run(job);
                        }
                    })
                    .expect("failed to spawn recipe worker")
            })
            .collect();

        Self {
            tx,
            workers: handles,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn submit(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(capacity = self.capacity, "recipe queue full; job dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("recipe workers stopped; job dropped");
            }
        }
    }
}

impl Drop for ReactionPool {
    fn drop(&mut self) {
        // Close the channel: workers drain queued jobs, then exit.
        let (dummy, _) = bounded(1);
        drop(mem::replace(&mut self.tx, dummy));
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl EngineShared {
    fn route(&self, delivery: EventDelivery) -> HubResult<()> {
        let EventDelivery {
            subscription_id,
            event,
        } = delivery;
        match event {
            AppEvent::StorageChange { info, .. } => {
                let recipe_id = self.core.lock()?.by_subscription.get(&subscription_id).copied();
                match recipe_id {
                    Some(recipe_id) => self.pool.submit(Job::React { recipe_id, info }),
                    None => debug!(%subscription_id, "change for untracked subscription skipped"),
                }
            }
            AppEvent::AppAvailabilityChanged {
                app,
                availability: true,
            } => {
                let affected: Vec<RecipeId> = self
                    .core
                    .lock()?
                    .recipes
                    .iter()
                    .filter(|(_, definition)| definition.select.app == app)
                    .map(|(id, _)| *id)
                    .collect();
                for recipe_id in affected {
                    debug!(%recipe_id, source_app = %app, "source app available; resubscribing");
                    self.pool.submit(Job::Resubscribe { recipe_id });
                }
            }
            AppEvent::AppAvailabilityChanged { .. } => {}
        }
        Ok(())
    }
}

impl RemoteCallbacks for EngineCallbacks {
    fn handle_event(&self, delivery: EventDelivery) -> DeliveryReply {
        let Some(shared) = self.shared.upgrade() else {
            debug!("event for stopped recipe engine skipped");
            return DeliveryReply::Success;
        };
        match shared.route(delivery) {
            Ok(()) => DeliveryReply::Success,
            Err(err) => DeliveryReply::Error {
                message: err.to_string(),
            },
        }
    }
}

impl RecipeEngine {
    /// Starts the engine.
    ///
    /// Registers the engine as an app under `config.engine_app_identifier`,
    /// subscribes to availability changes, then loads and subscribes every
    /// stored recipe. Recipes whose source app is not connected yet are
    /// subscribed once it becomes available.
    pub fn start(
        registry: Arc<RemoteSessionRegistry>,
        bus: Arc<AppEventBus>,
        store: Arc<dyn RecipeStore>,
        config: &RecipeEngineConfig,
    ) -> HubResult<Self> {
        let core = Arc::new(EngineCore {
            registry,
            bus,
            store,
            identity: IdentifiedApp::new(ENGINE_APP_ID, config.engine_app_identifier.clone(), true),
            state: Mutex::new(EngineState::default()),
        });
        let pool = ReactionPool::start(
            config.reaction_workers,
            config.reaction_queue_capacity,
            &core,
        );
        let engine = Self {
            shared: Arc::new(EngineShared { core, pool }),
        };
        engine.setup()?;
        Ok(engine)
    }

    fn core(&self) -> &EngineCore {
        &self.shared.core
    }

    fn setup(&self) -> HubResult<()> {
        let core = self.core();
        let callbacks = Arc::new(EngineCallbacks {
            shared: Arc::downgrade(&self.shared),
        });
        core.registry
            .initialize_app(&core.identity.identifier, callbacks)?;
        core.bus.initialize_app(&core.identity)?;

        let availability = core
            .bus
            .subscribe_to_event(&core.identity, SubscriptionRequest::AppAvailabilityChanged)?
            .subscription_id();
        core.lock()?.availability = availability;

        let stored = core.store.load_all()?;
        let loaded = stored.len();
        for recipe in stored {
            if let Err(err) = recipe.definition.validate() {
                warn!(recipe_id = %recipe.id, error = %err, "stored recipe is invalid; skipped");
                continue;
            }
            self.register(recipe.id, recipe.definition)?;
        }
        info!(
            app = %core.identity.identifier,
            recipes = loaded,
            "recipe engine started"
        );
        Ok(())
    }

    fn register(&self, recipe_id: RecipeId, definition: RecipeDefinition) -> HubResult<()> {
        self.core()
            .lock()?
            .recipes
            .insert(recipe_id, Arc::new(definition));
        self.core().subscribe(recipe_id)
    }

    /// Validates, stores and activates a recipe.
    ///
    /// Creating a definition that is already registered returns the existing
    /// id without storing it again.
    ///
    /// # Errors
    /// Invalid definitions are rejected before anything is stored.
    pub fn create_recipe(&self, definition: RecipeDefinition) -> HubResult<RecipeId> {
        definition.validate()?;
        let recipe_id = RecipeId::for_definition(&definition)?;
        if self.core().lock()?.recipes.contains_key(&recipe_id) {
            debug!(%recipe_id, "recipe already registered");
            return Ok(recipe_id);
        }

        self.core().store.save(&StoredRecipe {
            id: recipe_id,
            definition: definition.clone(),
            created_at: Utc::now(),
        })?;
        info!(
            %recipe_id,
            source_app = %definition.select.app,
            collection = %definition.select.collection,
            "recipe created"
        );
        self.register(recipe_id, definition)?;
        Ok(recipe_id)
    }

    /// A registered recipe's definition.
    pub fn recipe(&self, recipe_id: RecipeId) -> HubResult<Option<RecipeDefinition>> {
        Ok(self
            .core()
            .definition(recipe_id)?
            .map(|definition| (*definition).clone()))
    }

    /// Number of registered recipes.
    pub fn recipe_count(&self) -> HubResult<usize> {
        Ok(self.core().lock()?.recipes.len())
    }

    /// The subscription currently feeding a recipe, if its source is connected.
    pub fn active_subscription(&self, recipe_id: RecipeId) -> HubResult<Option<SubscriptionId>> {
        Ok(self.core().lock()?.active.get(&recipe_id).copied())
    }

    /// Identifier the engine is registered under.
    #[must_use]
    pub fn app_identifier(&self) -> &str {
        &self.core().identity.identifier
    }

    /// Jobs dropped because the reaction queue was full.
    #[must_use]
    pub fn dropped_reactions(&self) -> u64 {
        self.shared.pool.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for RecipeEngine {
    fn drop(&mut self) {
        let core = self.core();
        if let Err(err) = core.bus.cleanup_app(&core.identity) {
            warn!(error = %err, "recipe engine cleanup failed");
        }
        if let Err(err) = core.registry.cleanup_app(&core.identity.identifier) {
            warn!(error = %err, "recipe engine session cleanup failed");
        }
    }
}

impl fmt::Debug for RecipeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeEngine")
            .field("app", &self.app_identifier())
            .field("dropped_reactions", &self.dropped_reactions())
            .finish_non_exhaustive()
    }
}
