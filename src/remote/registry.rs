//! Remote session registry.
//!
//! Tracks the callback handlers of every identified remote app and offers one
//! dispatch entry point. A missing session is reported as
//! [`CallbackOutcome::AppNotFound`], never as an error, and nothing is invoked
//! in that case. Dispatch makes a single attempt; there are no retries.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{HubError, HubResult};
use crate::events::{EventDelivery, SubscriptionRequest};
use crate::storage::Operation;

use super::callbacks::{
    CallbackMethod, DeliveryReply, RemoteCallReply, RemoteCallRequest, RemoteCallbacks,
    RemoteOperationReply, RemoteOperationRequest, SubscriptionReply, UnsubscriptionReply,
};

/// Callback handlers of one identified remote app.
pub struct RemoteSession {
    /// Identifier the app registered with.
    pub app_identifier: String,
    /// Handlers the app supplied.
    pub callbacks: Arc<dyn RemoteCallbacks>,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("app_identifier", &self.app_identifier)
            .finish_non_exhaustive()
    }
}

/// Result of dispatching a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome<T> {
    /// The session existed and the callback ran; carries its reply.
    Success(T),
    /// No live session for the identifier.
    AppNotFound,
}

impl<T> CallbackOutcome<T> {
    /// Status string as seen on the wire.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::AppNotFound => "app-not-found",
        }
    }
}

/// Map of live remote sessions keyed by app identifier.
#[derive(Debug, Default)]
pub struct RemoteSessionRegistry {
    sessions: RwLock<HashMap<String, Arc<RemoteSession>>>,
}

impl RemoteSessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the callbacks of an app. A reconnecting app replaces its
    /// previous session.
    pub fn initialize_app(
        &self,
        app_identifier: &str,
        callbacks: Arc<dyn RemoteCallbacks>,
    ) -> HubResult<()> {
        let session = Arc::new(RemoteSession {
            app_identifier: app_identifier.to_string(),
            callbacks,
        });
        let replaced = self
            .sessions
            .write()
            .map_err(|_| HubError::lock_poisoned("remote_sessions.write"))?
            .insert(app_identifier.to_string(), session)
            .is_some();
        info!(app = %app_identifier, replaced, "remote session initialized");
        Ok(())
    }

    /// Drops the session of an app. Unknown identifiers are ignored.
    pub fn cleanup_app(&self, app_identifier: &str) -> HubResult<()> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| HubError::lock_poisoned("remote_sessions.write"))?
            .remove(app_identifier)
            .is_some();
        if removed {
            info!(app = %app_identifier, "remote session removed");
        }
        Ok(())
    }

    /// Looks up a session.
    pub fn get_remote_session(
        &self,
        app_identifier: &str,
    ) -> HubResult<Option<Arc<RemoteSession>>> {
        Ok(self
            .sessions
            .read()
            .map_err(|_| HubError::lock_poisoned("remote_sessions.read"))?
            .get(app_identifier)
            .cloned())
    }

    /// Returns true if the app has a live session.
    pub fn has_session(&self, app_identifier: &str) -> HubResult<bool> {
        Ok(self.get_remote_session(app_identifier)?.is_some())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> HubResult<usize> {
        Ok(self
            .sessions
            .read()
            .map_err(|_| HubError::lock_poisoned("remote_sessions.read"))?
            .len())
    }

    /// Dispatches one callback to an app.
    ///
    /// `invoke` runs with no registry lock held, so a callback may re-enter the
    /// registry.
    pub fn execute_callback<T>(
        &self,
        app_identifier: &str,
        method: CallbackMethod,
        invoke: impl FnOnce(&dyn RemoteCallbacks) -> T,
    ) -> HubResult<CallbackOutcome<T>> {
        let Some(session) = self.get_remote_session(app_identifier)? else {
            debug!(app = %app_identifier, %method, "callback target not found");
            return Ok(CallbackOutcome::AppNotFound);
        };
        debug!(app = %app_identifier, %method, "dispatching callback");
        Ok(CallbackOutcome::Success(invoke(session.callbacks.as_ref())))
    }

    /// Dispatches `handleRemoteOperation`.
    pub fn remote_operation(
        &self,
        app_identifier: &str,
        operation: Operation,
        source_app: &str,
    ) -> HubResult<CallbackOutcome<RemoteOperationReply>> {
        let request = RemoteOperationRequest {
            operation,
            source_app: source_app.to_string(),
        };
        self.execute_callback(app_identifier, CallbackMethod::HandleRemoteOperation, |cb| {
            cb.handle_remote_operation(request)
        })
    }

    /// Dispatches `handleRemoteCall`.
    pub fn remote_call(
        &self,
        app_identifier: &str,
        call: &str,
        args: Value,
    ) -> HubResult<CallbackOutcome<RemoteCallReply>> {
        let request = RemoteCallRequest {
            call: call.to_string(),
            args,
        };
        self.execute_callback(app_identifier, CallbackMethod::HandleRemoteCall, |cb| {
            cb.handle_remote_call(request)
        })
    }

    /// Dispatches `handleEvent`.
    pub fn deliver_event(
        &self,
        app_identifier: &str,
        delivery: EventDelivery,
    ) -> HubResult<CallbackOutcome<DeliveryReply>> {
        self.execute_callback(app_identifier, CallbackMethod::HandleEvent, |cb| {
            cb.handle_event(delivery)
        })
    }

    /// Dispatches `handleSubscription`.
    pub fn request_subscription(
        &self,
        app_identifier: &str,
        request: SubscriptionRequest,
    ) -> HubResult<CallbackOutcome<SubscriptionReply>> {
        self.execute_callback(app_identifier, CallbackMethod::HandleSubscription, |cb| {
            cb.handle_subscription(request)
        })
    }

    /// Dispatches `handleUnsubscription`.
    pub fn request_unsubscription(
        &self,
        app_identifier: &str,
        external_id: &str,
    ) -> HubResult<CallbackOutcome<UnsubscriptionReply>> {
        self.execute_callback(app_identifier, CallbackMethod::HandleUnsubscription, |cb| {
            cb.handle_unsubscription(external_id.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;

    #[derive(Default)]
    struct Spy {
        calls: AtomicUsize,
    }

    impl RemoteCallbacks for Spy {
        fn handle_remote_call(&self, request: RemoteCallRequest) -> RemoteCallReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RemoteCallReply::Success {
                result: json!({"echo": request.args}),
            }
        }
    }

    #[test]
    fn missing_session_invokes_nothing() {
        let registry = RemoteSessionRegistry::new();
        let spy = Arc::new(Spy::default());
        registry.initialize_app("other", spy.clone()).unwrap();

        let mut invoked = false;
        let outcome = registry
            .execute_callback("nobody", CallbackMethod::HandleRemoteCall, |_| invoked = true)
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::AppNotFound);
        assert_eq!(outcome.status(), "app-not-found");
        assert!(!invoked);
        assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatches_to_registered_session() {
        let registry = RemoteSessionRegistry::new();
        let spy = Arc::new(Spy::default());
        registry.initialize_app("peer", spy.clone()).unwrap();

        let outcome = registry.remote_call("peer", "echo", json!(1)).unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Success(RemoteCallReply::Success {
                result: json!({"echo": 1})
            })
        );
        assert_eq!(spy.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unimplemented_callback_is_in_band() {
        let registry = RemoteSessionRegistry::new();
        registry.initialize_app("peer", Arc::new(Spy::default())).unwrap();

        let outcome = registry.request_unsubscription("peer", "ext").unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Success(UnsubscriptionReply::NotImplemented)
        );
    }

    #[test]
    fn reinitialize_replaces_and_cleanup_removes() {
        let registry = RemoteSessionRegistry::new();
        let first = Arc::new(Spy::default());
        let second = Arc::new(Spy::default());
        registry.initialize_app("peer", first.clone()).unwrap();
        registry.initialize_app("peer", second.clone()).unwrap();
        assert_eq!(registry.session_count().unwrap(), 1);

        registry.remote_call("peer", "x", Value::Null).unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        registry.cleanup_app("peer").unwrap();
        assert!(!registry.has_session("peer").unwrap());
        assert_eq!(
            registry.remote_call("peer", "x", Value::Null).unwrap(),
            CallbackOutcome::AppNotFound
        );
    }
}
