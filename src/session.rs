//! Per-connection session facade.
//!
//! A [`HubSession`] is what the API layer holds for one connected app. It
//! starts unidentified; every call that acts on behalf of an app requires
//! [`HubSession::identify`] first.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::app::{validate_identifier, IdentifiedApp};
use crate::error::{HubResult, ProtocolError, ValidationError};
use crate::events::{AppEvent, EventKind, SubscribeOutcome, SubscriptionId, SubscriptionRequest};
use crate::hub::Hub;
use crate::recipes::{RecipeDefinition, RecipeId};
use crate::remote::{CallbackOutcome, RemoteCallReply, RemoteCallbacks, RemoteOperationReply};
use crate::storage::Operation;

/// One connected app's view of the hub.
#[derive(Debug)]
pub struct HubSession {
    hub: Arc<Hub>,
    app: Option<IdentifiedApp>,
}

impl HubSession {
    /// An unidentified session.
    #[must_use]
    pub const fn new(hub: Arc<Hub>) -> Self {
        Self { hub, app: None }
    }

    /// The identified app, if any.
    #[must_use]
    pub const fn app(&self) -> Option<&IdentifiedApp> {
        self.app.as_ref()
    }

    fn identified(&self) -> HubResult<&IdentifiedApp> {
        self.app
            .as_ref()
            .ok_or_else(|| ProtocolError::NotIdentified.into())
    }

    /// Binds the session to an app whose token the caller has verified.
    ///
    /// Supplying `callbacks` makes the app remote: the hub may then call into
    /// it and deliver its subscriptions. The session is registered before the
    /// app is announced as available, so availability listeners can reach it
    /// immediately.
    ///
    /// # Errors
    /// A session identifies once. The recipe engine's identifier is reserved.
    pub fn identify(
        &mut self,
        app: IdentifiedApp,
        callbacks: Option<Arc<dyn RemoteCallbacks>>,
    ) -> HubResult<()> {
        if let Some(current) = &self.app {
            return Err(ProtocolError::AlreadyIdentified {
                identifier: current.identifier.clone(),
            }
            .into());
        }
        validate_identifier("app", &app.identifier)?;
        if app.identifier == self.hub.recipes().app_identifier() {
            return Err(ValidationError::InvalidIdentifier {
                field: "app".to_string(),
                value: app.identifier,
            }
            .into());
        }

        let app = IdentifiedApp {
            is_remote: callbacks.is_some(),
            ..app
        };
        if let Some(callbacks) = callbacks {
            self.hub
                .registry()
                .initialize_app(&app.identifier, callbacks)?;
        }
        self.hub.bus().initialize_app(&app)?;
        debug!(app = %app.identifier, is_remote = app.is_remote, "session identified");
        self.app = Some(app);
        Ok(())
    }

    /// Subscribes this app to an event.
    pub fn subscribe_to_event(&self, request: SubscriptionRequest) -> HubResult<SubscribeOutcome> {
        let app = self.identified()?;
        self.hub.bus().subscribe_to_event(app, request)
    }

    /// Cancels one of this app's subscriptions.
    ///
    /// # Errors
    /// Ids this app does not own are reported as unknown.
    pub fn unsubscribe_from_event(&self, subscription_id: SubscriptionId) -> HubResult<()> {
        let app = self.identified()?;
        let owner = self.hub.bus().subscription_owner(subscription_id)?;
        if owner.as_deref() != Some(app.identifier.as_str()) {
            return Err(ProtocolError::UnknownSubscription {
                subscription_id: subscription_id.to_string(),
            }
            .into());
        }
        self.hub.bus().unsubscribe_from_event(subscription_id)
    }

    /// Emits an event of this app.
    ///
    /// With `synchronous`, every listener has run when this returns and the
    /// first listener error is returned. Otherwise the event is queued.
    ///
    /// # Errors
    /// Availability events are emitted by the hub only, and an app may only
    /// emit events about itself.
    pub fn emit_event(&self, event: AppEvent, synchronous: bool) -> HubResult<()> {
        let app = self.identified()?;
        if event.kind() == EventKind::AppAvailabilityChanged {
            return Err(ProtocolError::ReservedEvent {
                event: event.kind().to_string(),
            }
            .into());
        }
        if event.app() != app.identifier {
            return Err(ProtocolError::ForeignEvent {
                app: event.app().to_string(),
            }
            .into());
        }
        if synchronous {
            self.hub.bus().emit_awaited(&event)
        } else {
            self.hub.bus().emit_fire_and_forget(event)
        }
    }

    /// Runs an operation on another app's storage through its
    /// `handleRemoteOperation` callback.
    pub fn execute_remote_operation(
        &self,
        target_app: &str,
        operation: Operation,
    ) -> HubResult<CallbackOutcome<RemoteOperationReply>> {
        let app = self.identified()?;
        self.hub
            .registry()
            .remote_operation(target_app, operation, &app.identifier)
    }

    /// Invokes a named call on another app.
    pub fn execute_remote_call(
        &self,
        target_app: &str,
        call: &str,
        args: Value,
    ) -> HubResult<CallbackOutcome<RemoteCallReply>> {
        self.identified()?;
        self.hub.registry().remote_call(target_app, call, args)
    }

    /// Creates a recipe.
    pub fn create_recipe(&self, definition: RecipeDefinition) -> HubResult<RecipeId> {
        self.identified()?;
        self.hub.recipes().create_recipe(definition)
    }

    /// Ends the session: the app's subscriptions and listener table are
    /// destroyed, it is announced as unavailable, and its remote session is
    /// dropped. Destroying an unidentified session does nothing.
    pub fn destroy(&mut self) -> HubResult<()> {
        let Some(app) = self.app.take() else {
            return Ok(());
        };
        self.hub.bus().cleanup_app(&app)?;
        if app.is_remote {
            self.hub.registry().cleanup_app(&app.identifier)?;
        }
        debug!(app = %app.identifier, "session destroyed");
        Ok(())
    }
}

impl Drop for HubSession {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!(error = %err, "session cleanup failed");
        }
    }
}
