//! App event bus.
//!
//! Owns one listener table per initialized app plus a global table for
//! availability changes, and the lifecycle of every subscription. Storage
//! change subscriptions are proxied: the target app allocates its own id via
//! `handleSubscription`, and the bus hands the subscriber a separate, locally
//! owned id.
//!
//! No bus lock is held while a listener or a remote callback runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::app::IdentifiedApp;
use crate::config::EventBusConfig;
use crate::error::{ExecutionError, HubError, HubResult, ProtocolError};
use crate::remote::{
    CallbackOutcome, DeliveryReply, RemoteSessionRegistry, SubscriptionReply, UnsubscriptionReply,
};

use super::dispatcher::EventDispatcher;
use super::emitter::{EventEmitter, Listener};
use super::types::{
    AppEvent, EventDelivery, EventKind, ListenerId, SubscribeOutcome, SubscriptionId,
    SubscriptionRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum EmitterRef {
    Global,
    App(String),
}

#[derive(Debug)]
struct PeerSubscription {
    app: String,
    external_id: String,
}

#[derive(Debug)]
struct SubscriptionEntry {
    owner: String,
    emitter: EmitterRef,
    listener: ListenerId,
    peer: Option<PeerSubscription>,
}

#[derive(Debug, Default)]
struct BusState {
    global: EventEmitter,
    apps: HashMap<String, EventEmitter>,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
}

impl BusState {
    fn snapshot(&self, event: &AppEvent) -> Vec<Listener> {
        match event {
            AppEvent::AppAvailabilityChanged { .. } => self.global.listeners_for(event.kind()),
            AppEvent::StorageChange { app, .. } => self
                .apps
                .get(app)
                .map(|emitter| emitter.listeners_for(event.kind()))
                .unwrap_or_default(),
        }
    }

    fn remove_listener(&mut self, emitter: &EmitterRef, listener: ListenerId) -> bool {
        match emitter {
            EmitterRef::Global => self.global.off(listener),
            EmitterRef::App(app) => self
                .apps
                .get_mut(app)
                .is_some_and(|emitter| emitter.off(listener)),
        }
    }
}

/// Publish/subscribe hub for app events.
pub struct AppEventBus {
    registry: Arc<RemoteSessionRegistry>,
    state: Mutex<BusState>,
    dispatcher: EventDispatcher,
}

impl AppEventBus {
    /// Creates a bus that proxies remote subscriptions through `registry`.
    #[must_use]
    pub fn new(registry: Arc<RemoteSessionRegistry>, config: &EventBusConfig) -> Self {
        Self {
            registry,
            state: Mutex::new(BusState::default()),
            dispatcher: EventDispatcher::start(config.dispatch_queue_capacity),
        }
    }

    /// The registry used to reach remote apps.
    #[must_use]
    pub const fn registry(&self) -> &Arc<RemoteSessionRegistry> {
        &self.registry
    }

    fn lock(&self) -> HubResult<MutexGuard<'_, BusState>> {
        self.state
            .lock()
            .map_err(|_| HubError::lock_poisoned("event_bus.state"))
    }

    /// Resets the app's listener table and announces it as available.
    pub fn initialize_app(&self, app: &IdentifiedApp) -> HubResult<()> {
        self.lock()?
            .apps
            .insert(app.identifier.clone(), EventEmitter::new());
        info!(app = %app.identifier, "app initialized on event bus");
        self.announce(&app.identifier, true);
        Ok(())
    }

    /// Destroys the app's subscriptions and listener table, then announces it
    /// as unavailable.
    pub fn cleanup_app(&self, app: &IdentifiedApp) -> HubResult<()> {
        let owned: Vec<SubscriptionId> = self
            .lock()?
            .subscriptions
            .iter()
            .filter(|(_, entry)| entry.owner == app.identifier)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            if let Err(err) = self.unsubscribe_from_event(id) {
                warn!(
                    app = %app.identifier,
                    subscription_id = %id,
                    error = %err,
                    "cleanup unsubscription failed"
                );
            }
        }

        self.lock()?.apps.remove(&app.identifier);
        info!(app = %app.identifier, "app cleaned up on event bus");
        self.announce(&app.identifier, false);
        Ok(())
    }

    fn announce(&self, app: &str, availability: bool) {
        let event = AppEvent::AppAvailabilityChanged {
            app: app.to_string(),
            availability,
        };
        if let Err(err) = self.emit_awaited(&event) {
            warn!(app = %app, availability, error = %err, "availability listener failed");
        }
    }

    /// Creates a subscription owned by `subscriber`.
    ///
    /// Events are forwarded to the subscriber's `handleEvent` callback.
    pub fn subscribe_to_event(
        &self,
        subscriber: &IdentifiedApp,
        request: SubscriptionRequest,
    ) -> HubResult<SubscribeOutcome> {
        match request {
            SubscriptionRequest::AppAvailabilityChanged => {
                let subscription_id = SubscriptionId::new();
                let listener = self.forwarder(subscription_id, &subscriber.identifier, None);
                let mut state = self.lock()?;
                let listener_id = state.global.on(EventKind::AppAvailabilityChanged, listener);
                state.subscriptions.insert(
                    subscription_id,
                    SubscriptionEntry {
                        owner: subscriber.identifier.clone(),
                        emitter: EmitterRef::Global,
                        listener: listener_id,
                        peer: None,
                    },
                );
                drop(state);
                debug!(
                    app = %subscriber.identifier,
                    %subscription_id,
                    "availability subscription created"
                );
                Ok(SubscribeOutcome::Success { subscription_id })
            }
            SubscriptionRequest::StorageChange { app, collections } => {
                if !self.registry.has_session(&app)? {
                    return Ok(SubscribeOutcome::AppNotFound);
                }
                let forwarded = SubscriptionRequest::StorageChange {
                    app: app.clone(),
                    collections: collections.clone(),
                };
                let external_id = match self.registry.request_subscription(&app, forwarded)? {
                    CallbackOutcome::AppNotFound => return Ok(SubscribeOutcome::AppNotFound),
                    CallbackOutcome::Success(SubscriptionReply::Success { subscription_id }) => {
                        subscription_id
                    }
                    CallbackOutcome::Success(reply) => {
                        debug!(target_app = %app, ?reply, "storage subscription declined");
                        return Ok(SubscribeOutcome::AppNotSupported);
                    }
                };

                let subscription_id = SubscriptionId::new();
                let listener = self.forwarder(subscription_id, &subscriber.identifier, collections);
                let mut state = self.lock()?;
                let listener_id = state
                    .apps
                    .entry(app.clone())
                    .or_default()
                    .on(EventKind::StorageChange, listener);
                state.subscriptions.insert(
                    subscription_id,
                    SubscriptionEntry {
                        owner: subscriber.identifier.clone(),
                        emitter: EmitterRef::App(app.clone()),
                        listener: listener_id,
                        peer: Some(PeerSubscription { app, external_id }),
                    },
                );
                drop(state);
                debug!(
                    app = %subscriber.identifier,
                    %subscription_id,
                    "storage subscription created"
                );
                Ok(SubscribeOutcome::Success { subscription_id })
            }
        }
    }

    fn forwarder(
        &self,
        subscription_id: SubscriptionId,
        subscriber: &str,
        collections: Option<Vec<String>>,
    ) -> Listener {
        let registry = Arc::clone(&self.registry);
        let subscriber = subscriber.to_string();
        Arc::new(move |event: &AppEvent| {
            let event = match event {
                AppEvent::StorageChange { app, info } => {
                    let info = match &collections {
                        Some(collections) => info.retain_collections(collections),
                        None => info.clone(),
                    };
                    if info.is_empty() {
                        return Ok(());
                    }
                    AppEvent::StorageChange {
                        app: app.clone(),
                        info,
                    }
                }
                AppEvent::AppAvailabilityChanged { .. } => event.clone(),
            };
            match registry.deliver_event(&subscriber, EventDelivery { subscription_id, event })? {
                CallbackOutcome::Success(DeliveryReply::Error { message }) => {
                    Err(ExecutionError::ListenerFailed {
                        message: format!("{subscriber}: {message}"),
                    }
                    .into())
                }
                CallbackOutcome::Success(_) => Ok(()),
                CallbackOutcome::AppNotFound => {
                    debug!(
                        app = %subscriber,
                        %subscription_id,
                        "subscriber has no session; event skipped"
                    );
                    Ok(())
                }
            }
        })
    }

    /// Owner of a subscription, if it exists.
    pub fn subscription_owner(&self, subscription_id: SubscriptionId) -> HubResult<Option<String>> {
        Ok(self
            .lock()?
            .subscriptions
            .get(&subscription_id)
            .map(|entry| entry.owner.clone()))
    }

    /// Destroys a subscription.
    ///
    /// The local listener is removed first; for proxied subscriptions the
    /// target app is then asked to release its external id. Events already
    /// handed to the dispatcher are still delivered.
    ///
    /// # Errors
    /// Unknown ids are a protocol error.
    pub fn unsubscribe_from_event(&self, subscription_id: SubscriptionId) -> HubResult<()> {
        let entry = {
            let mut state = self.lock()?;
            let entry = state.subscriptions.remove(&subscription_id).ok_or_else(|| {
                ProtocolError::UnknownSubscription {
                    subscription_id: subscription_id.to_string(),
                }
            })?;
            let removed = state.remove_listener(&entry.emitter, entry.listener);
            debug!(%subscription_id, listener_removed = removed, "subscription removed");
            entry
        };

        if let Some(peer) = entry.peer {
            match self
                .registry
                .request_unsubscription(&peer.app, &peer.external_id)?
            {
                CallbackOutcome::Success(UnsubscriptionReply::Success) => {}
                outcome => debug!(
                    target_app = %peer.app,
                    external_id = %peer.external_id,
                    ?outcome,
                    "peer did not confirm unsubscription"
                ),
            }
        }
        Ok(())
    }

    /// Runs every listener registered for the event, in registration order,
    /// on the calling thread. A failing listener does not stop the ones after
    /// it; the first error is returned once all of them have run.
    pub fn emit_awaited(&self, event: &AppEvent) -> HubResult<()> {
        let listeners = self.lock()?.snapshot(event);
        let mut first_error = None;
        for listener in listeners {
            if let Err(err) = listener(event) {
                warn!(kind = %event.kind(), error = %err, "event listener failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Queues the event for the dispatcher thread and returns immediately.
    pub fn emit_fire_and_forget(&self, event: AppEvent) -> HubResult<()> {
        let listeners = self.lock()?.snapshot(&event);
        self.dispatcher.dispatch(listeners, event);
        Ok(())
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> HubResult<usize> {
        Ok(self.lock()?.subscriptions.len())
    }

    /// Fire-and-forget events dropped because the dispatch queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dispatcher.dropped()
    }
}

impl fmt::Debug for AppEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppEventBus")
            .field("registry", &self.registry)
            .field("dropped_events", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use crate::app::AppId;
    use crate::change_watch::{StorageChange, StorageChangeInfo};
    use crate::remote::RemoteCallbacks;

    #[derive(Default)]
    struct Peer {
        events: Mutex<Vec<EventDelivery>>,
        unsubscribed: Mutex<Vec<String>>,
        accept_subscriptions: bool,
    }

    impl RemoteCallbacks for Peer {
        fn handle_event(&self, delivery: EventDelivery) -> DeliveryReply {
            self.events.lock().unwrap().push(delivery);
            DeliveryReply::Success
        }

        fn handle_subscription(&self, _request: SubscriptionRequest) -> SubscriptionReply {
            if self.accept_subscriptions {
                SubscriptionReply::Success {
                    subscription_id: "ext-1".to_string(),
                }
            } else {
                SubscriptionReply::AppNotSupported
            }
        }

        fn handle_unsubscription(&self, subscription_id: String) -> UnsubscriptionReply {
            self.unsubscribed.lock().unwrap().push(subscription_id);
            UnsubscriptionReply::Success
        }
    }

    fn app(identifier: &str) -> IdentifiedApp {
        IdentifiedApp::new(AppId(1), identifier, true)
    }

    fn bus_with(peers: &[(&str, Arc<Peer>)]) -> AppEventBus {
        let registry = Arc::new(RemoteSessionRegistry::new());
        for (name, peer) in peers {
            registry.initialize_app(name, peer.clone()).unwrap();
        }
        AppEventBus::new(registry, &EventBusConfig::default())
    }

    fn tag_change(collection: &str) -> StorageChange {
        StorageChange::Create {
            collection: collection.to_string(),
            pk: json!(1),
            values: serde_json::Map::new(),
        }
    }

    #[test]
    fn availability_listeners_fire_until_unsubscribed() {
        let watcher = Arc::new(Peer::default());
        let bus = bus_with(&[("watcher", watcher.clone())]);

        let first = bus
            .subscribe_to_event(&app("watcher"), SubscriptionRequest::AppAvailabilityChanged)
            .unwrap()
            .subscription_id()
            .unwrap();
        let second = bus
            .subscribe_to_event(&app("watcher"), SubscriptionRequest::AppAvailabilityChanged)
            .unwrap()
            .subscription_id()
            .unwrap();

        bus.cleanup_app(&app("notes")).unwrap();
        {
            let events = watcher.events.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].subscription_id, first);
            assert_eq!(events[1].subscription_id, second);
            assert!(events.iter().all(|d| d.event
                == AppEvent::AppAvailabilityChanged {
                    app: "notes".to_string(),
                    availability: false,
                }));
        }

        bus.unsubscribe_from_event(first).unwrap();
        bus.initialize_app(&app("notes")).unwrap();
        let events = watcher.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].subscription_id, second);
    }

    #[test]
    fn unknown_subscription_is_protocol_error() {
        let bus = bus_with(&[]);
        let err = bus.unsubscribe_from_event(SubscriptionId::new()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn storage_subscription_outcomes() {
        let declining = Arc::new(Peer::default());
        let bus = bus_with(&[("declining", declining)]);

        let missing = bus
            .subscribe_to_event(
                &app("sub"),
                SubscriptionRequest::StorageChange {
                    app: "absent".to_string(),
                    collections: None,
                },
            )
            .unwrap();
        assert_eq!(missing, SubscribeOutcome::AppNotFound);

        let declined = bus
            .subscribe_to_event(
                &app("sub"),
                SubscriptionRequest::StorageChange {
                    app: "declining".to_string(),
                    collections: None,
                },
            )
            .unwrap();
        assert_eq!(declined, SubscribeOutcome::AppNotSupported);
        assert_eq!(bus.subscription_count().unwrap(), 0);
    }

    #[test]
    fn storage_changes_are_filtered_by_collection() {
        let source = Arc::new(Peer {
            accept_subscriptions: true,
            ..Peer::default()
        });
        let sink = Arc::new(Peer::default());
        let bus = bus_with(&[("src", source.clone()), ("sink", sink.clone())]);
        bus.initialize_app(&app("src")).unwrap();

        let id = bus
            .subscribe_to_event(
                &app("sink"),
                SubscriptionRequest::StorageChange {
                    app: "src".to_string(),
                    collections: Some(vec!["tags".to_string()]),
                },
            )
            .unwrap()
            .subscription_id()
            .unwrap();

        bus.emit_awaited(&AppEvent::StorageChange {
            app: "src".to_string(),
            info: StorageChangeInfo::new(vec![tag_change("notes")]),
        })
        .unwrap();
        assert!(sink.events.lock().unwrap().is_empty());

        bus.emit_awaited(&AppEvent::StorageChange {
            app: "src".to_string(),
            info: StorageChangeInfo::new(vec![tag_change("notes"), tag_change("tags")]),
        })
        .unwrap();
        {
            let events = sink.events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(
                events[0].event,
                AppEvent::StorageChange {
                    app: "src".to_string(),
                    info: StorageChangeInfo::new(vec![tag_change("tags")]),
                }
            );
        }

        bus.unsubscribe_from_event(id).unwrap();
        assert_eq!(*source.unsubscribed.lock().unwrap(), vec!["ext-1".to_string()]);
    }

    #[test]
    fn cleanup_destroys_owned_subscriptions() {
        let source = Arc::new(Peer {
            accept_subscriptions: true,
            ..Peer::default()
        });
        let sink = Arc::new(Peer::default());
        let bus = bus_with(&[("src", source.clone()), ("sink", sink)]);

        bus.subscribe_to_event(
            &app("sink"),
            SubscriptionRequest::StorageChange {
                app: "src".to_string(),
                collections: None,
            },
        )
        .unwrap();
        bus.subscribe_to_event(&app("sink"), SubscriptionRequest::AppAvailabilityChanged)
            .unwrap();
        assert_eq!(bus.subscription_count().unwrap(), 2);

        bus.cleanup_app(&app("sink")).unwrap();
        assert_eq!(bus.subscription_count().unwrap(), 0);
        assert_eq!(source.unsubscribed.lock().unwrap().len(), 1);
    }

    #[test]
    fn failing_listener_does_not_hide_event_from_later_listeners() {
        struct Failing;
        impl RemoteCallbacks for Failing {
            fn handle_event(&self, _delivery: EventDelivery) -> DeliveryReply {
                DeliveryReply::Error {
                    message: "boom".to_string(),
                }
            }
        }

        let healthy = Arc::new(Peer::default());
        let registry = Arc::new(RemoteSessionRegistry::new());
        registry.initialize_app("failing", Arc::new(Failing)).unwrap();
        registry.initialize_app("healthy", healthy.clone()).unwrap();
        let bus = AppEventBus::new(registry, &EventBusConfig::default());
        bus.subscribe_to_event(&app("failing"), SubscriptionRequest::AppAvailabilityChanged)
            .unwrap();
        bus.subscribe_to_event(&app("healthy"), SubscriptionRequest::AppAvailabilityChanged)
            .unwrap();

        let err = bus
            .emit_awaited(&AppEvent::AppAvailabilityChanged {
                app: "x".to_string(),
                availability: true,
            })
            .unwrap_err();
        assert!(err.is_execution());
        assert_eq!(healthy.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn fire_and_forget_delivers_later() {
        let watcher = Arc::new(Peer::default());
        let bus = bus_with(&[("watcher", watcher.clone())]);
        bus.subscribe_to_event(&app("watcher"), SubscriptionRequest::AppAvailabilityChanged)
            .unwrap();

        bus.emit_fire_and_forget(AppEvent::AppAvailabilityChanged {
            app: "x".to_string(),
            availability: true,
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while watcher.events.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "event not delivered");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
