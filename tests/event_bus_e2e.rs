use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::json;

use apphub::remote::{DeliveryReply, SubscriptionReply, UnsubscriptionReply};
use apphub::{
    AppEvent, AppId, EventDelivery, Hub, HubConfig, HubSession, IdentifiedApp,
    InMemoryObjectStorage, InMemoryRecipeStore, Operation, RemoteCallbacks, SubscribeOutcome,
    SubscriptionId, SubscriptionRequest,
};

const WAIT: Duration = Duration::from_secs(2);

struct App {
    deliveries: Sender<EventDelivery>,
    unsubscriptions: Sender<String>,
    accepts_subscriptions: bool,
    next_external: AtomicUsize,
}

impl RemoteCallbacks for App {
    fn handle_event(&self, delivery: EventDelivery) -> DeliveryReply {
        let _ = self.deliveries.send(delivery);
        DeliveryReply::Success
    }

    fn handle_subscription(&self, _request: SubscriptionRequest) -> SubscriptionReply {
        if !self.accepts_subscriptions {
            return SubscriptionReply::AppNotSupported;
        }
        let n = self.next_external.fetch_add(1, Ordering::SeqCst);
        SubscriptionReply::Success {
            subscription_id: format!("external-{n}"),
        }
    }

    fn handle_unsubscription(&self, external_id: String) -> UnsubscriptionReply {
        let _ = self.unsubscriptions.send(external_id);
        UnsubscriptionReply::Success
    }
}

struct Inbox {
    deliveries: Receiver<EventDelivery>,
    unsubscriptions: Receiver<String>,
}

fn hub() -> Arc<Hub> {
    Arc::new(Hub::new(HubConfig::default(), Arc::new(InMemoryRecipeStore::new())).unwrap())
}

fn connect(
    hub: &Arc<Hub>,
    id: u64,
    name: &str,
    accepts_subscriptions: bool,
) -> (HubSession, Inbox) {
    let (deliveries_tx, deliveries) = unbounded();
    let (unsub_tx, unsubscriptions) = unbounded();
    let app = Arc::new(App {
        deliveries: deliveries_tx,
        unsubscriptions: unsub_tx,
        accepts_subscriptions,
        next_external: AtomicUsize::new(0),
    });
    let mut session = hub.open_session();
    session
        .identify(
            IdentifiedApp::new(AppId(id), name, true),
            Some(app as Arc<dyn RemoteCallbacks>),
        )
        .unwrap();
    (
        session,
        Inbox {
            deliveries,
            unsubscriptions,
        },
    )
}

fn availability(delivery: &EventDelivery) -> (String, bool) {
    match &delivery.event {
        AppEvent::AppAvailabilityChanged { app, availability } => (app.clone(), *availability),
        other => panic!("expected availability event, got {other:?}"),
    }
}

fn subscribe(session: &HubSession, request: SubscriptionRequest) -> SubscriptionId {
    session
        .subscribe_to_event(request)
        .unwrap()
        .subscription_id()
        .unwrap()
}

#[test]
fn both_availability_subscriptions_fire_until_one_is_cancelled() {
    let hub = hub();
    let (observer, inbox) = connect(&hub, 1, "observer", true);
    let first = subscribe(&observer, SubscriptionRequest::AppAvailabilityChanged);
    let second = subscribe(&observer, SubscriptionRequest::AppAvailabilityChanged);

    let (mut leaving, _) = connect(&hub, 2, "leaving", true);
    leaving.destroy().unwrap();

    let seen: Vec<EventDelivery> = inbox.deliveries.try_iter().collect();
    assert_eq!(seen.len(), 4);
    let gone: Vec<SubscriptionId> = seen
        .iter()
        .filter(|d| availability(d) == ("leaving".to_string(), false))
        .map(|d| d.subscription_id)
        .collect();
    assert_eq!(gone, vec![first, second]);

    observer.unsubscribe_from_event(first).unwrap();
    let (_late, _) = connect(&hub, 3, "late", true);
    let seen: Vec<EventDelivery> = inbox.deliveries.try_iter().collect();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].subscription_id, second);
    assert_eq!(availability(&seen[0]), ("late".to_string(), true));
}

#[test]
fn storage_changes_reach_subscriber_filtered_by_collection() {
    let hub = hub();
    let (_notes, _) = connect(&hub, 1, "notes", true);
    let (reader, inbox) = connect(&hub, 2, "reader", true);

    let subscription_id = subscribe(
        &reader,
        SubscriptionRequest::StorageChange {
            app: "notes".to_string(),
            collections: Some(vec!["note".to_string()]),
        },
    );

    let storage = hub
        .watch_storage(
            "notes",
            InMemoryObjectStorage::new()
                .with_collection("note")
                .with_collection("draft"),
        )
        .unwrap();
    storage
        .execute(Operation::CreateObject {
            collection: "draft".to_string(),
            values: json!({"title": "secret"}).as_object().cloned().unwrap(),
        })
        .unwrap();
    storage
        .execute(Operation::ExecuteBatch {
            operations: vec![
                Operation::CreateObject {
                    collection: "note".to_string(),
                    values: json!({"title": "public"}).as_object().cloned().unwrap(),
                },
                Operation::CreateObject {
                    collection: "draft".to_string(),
                    values: json!({"title": "hidden"}).as_object().cloned().unwrap(),
                },
            ],
        })
        .unwrap();

    let delivered: Vec<EventDelivery> = inbox.deliveries.try_iter().collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].subscription_id, subscription_id);
    let AppEvent::StorageChange { app, info } = &delivered[0].event else {
        panic!("expected storage change");
    };
    assert_eq!(app, "notes");
    assert_eq!(info.changes.len(), 1);
    assert_eq!(info.changes[0].collection(), "note");
}

#[test]
fn remote_subscriptions_report_missing_or_unwilling_targets() {
    let hub = hub();
    let (reader, _) = connect(&hub, 1, "reader", true);
    let (_closed, _) = connect(&hub, 2, "closed", false);

    let request = |app: &str| SubscriptionRequest::StorageChange {
        app: app.to_string(),
        collections: None,
    };
    assert_eq!(
        reader.subscribe_to_event(request("nobody")).unwrap(),
        SubscribeOutcome::AppNotFound
    );
    assert_eq!(
        reader.subscribe_to_event(request("closed")).unwrap(),
        SubscribeOutcome::AppNotSupported
    );
}

#[test]
fn unsubscribing_releases_external_subscription() {
    let hub = hub();
    let (_notes, notes_inbox) = connect(&hub, 1, "notes", true);
    let (reader, _) = connect(&hub, 2, "reader", true);

    let id = subscribe(
        &reader,
        SubscriptionRequest::StorageChange {
            app: "notes".to_string(),
            collections: None,
        },
    );
    assert_ne!(id.to_string(), "external-0");

    reader.unsubscribe_from_event(id).unwrap();
    assert_eq!(notes_inbox.unsubscriptions.try_recv().unwrap(), "external-0");
    assert!(reader.unsubscribe_from_event(id).unwrap_err().is_protocol());
}

#[test]
fn destroying_a_session_drops_its_subscriptions() {
    let hub = hub();
    let (_notes, notes_inbox) = connect(&hub, 1, "notes", true);
    let before = hub.bus().subscription_count().unwrap();

    let (mut reader, _) = connect(&hub, 2, "reader", true);
    subscribe(&reader, SubscriptionRequest::AppAvailabilityChanged);
    subscribe(
        &reader,
        SubscriptionRequest::StorageChange {
            app: "notes".to_string(),
            collections: None,
        },
    );
    assert_eq!(hub.bus().subscription_count().unwrap(), before + 2);

    reader.destroy().unwrap();
    assert_eq!(hub.bus().subscription_count().unwrap(), before);
    assert_eq!(notes_inbox.unsubscriptions.try_recv().unwrap(), "external-0");
    assert!(!hub.registry().has_session("reader").unwrap());
}

#[test]
fn fire_and_forget_events_arrive_in_order() {
    let hub = hub();
    let (notes, _) = connect(&hub, 1, "notes", true);
    let (reader, inbox) = connect(&hub, 2, "reader", true);
    subscribe(
        &reader,
        SubscriptionRequest::StorageChange {
            app: "notes".to_string(),
            collections: None,
        },
    );

    for n in 0..5 {
        let info = serde_json::from_value(json!({"changes": [
            {"type": "delete", "collection": "note", "where": {}, "pks": [n]}
        ]}))
        .unwrap();
        notes
            .emit_event(
                AppEvent::StorageChange {
                    app: "notes".to_string(),
                    info,
                },
                false,
            )
            .unwrap();
    }

    let order: Vec<serde_json::Value> = (0..5)
        .map(|_| {
            let delivery = inbox.deliveries.recv_timeout(WAIT).unwrap();
            let AppEvent::StorageChange { info, .. } = delivery.event else {
                panic!("expected storage change");
            };
            serde_json::to_value(&info.changes[0]).unwrap()["pks"][0].clone()
        })
        .collect();
    assert_eq!(order, (0..5).map(|n| json!(n)).collect::<Vec<_>>());
    assert_eq!(hub.bus().dropped_events(), 0);
}

struct Broken;

impl RemoteCallbacks for Broken {
    fn handle_event(&self, _delivery: EventDelivery) -> DeliveryReply {
        DeliveryReply::Error {
            message: "sink offline".to_string(),
        }
    }
}

#[test]
fn broken_subscriber_does_not_starve_later_subscribers() {
    let hub = hub();
    let (notes, _) = connect(&hub, 1, "notes", true);
    let mut broken = hub.open_session();
    broken
        .identify(
            IdentifiedApp::new(AppId(2), "broken", true),
            Some(Arc::new(Broken) as Arc<dyn RemoteCallbacks>),
        )
        .unwrap();
    let (healthy, inbox) = connect(&hub, 3, "healthy", true);

    let request = || SubscriptionRequest::StorageChange {
        app: "notes".to_string(),
        collections: None,
    };
    subscribe(&broken, request());
    let healthy_id = subscribe(&healthy, request());

    let info = serde_json::from_value(json!({"changes": [
        {"type": "create", "collection": "note", "pk": 1, "values": {"title": "hi"}}
    ]}))
    .unwrap();
    let result = notes.emit_event(
        AppEvent::StorageChange {
            app: "notes".to_string(),
            info,
        },
        true,
    );

    assert!(result.is_err());
    let delivered: Vec<EventDelivery> = inbox.deliveries.try_iter().collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].subscription_id, healthy_id);
}
