//! Event, subscription and delivery types.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change_watch::StorageChangeInfo;

/// Unique identifier for a subscription held by the bus.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the textual form handed out to callers.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    /// Create a new random listener id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Kinds of events routed by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Changes to an app's storage.
    StorageChange,
    /// An app came online or went away.
    AppAvailabilityChanged,
}

impl EventKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StorageChange => "storage-change",
            Self::AppAvailabilityChanged => "app-availability-changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event flowing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppEvent {
    /// Storage changes made by `app`.
    StorageChange {
        /// App whose storage changed.
        app: String,
        /// The changes, in execution order.
        info: StorageChangeInfo,
    },
    /// `app` became available (`true`) or went away (`false`).
    AppAvailabilityChanged {
        /// App whose availability changed.
        app: String,
        /// New availability.
        availability: bool,
    },
}

impl AppEvent {
    /// The event's kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StorageChange { .. } => EventKind::StorageChange,
            Self::AppAvailabilityChanged { .. } => EventKind::AppAvailabilityChanged,
        }
    }

    /// App the event is about.
    #[must_use]
    pub fn app(&self) -> &str {
        match self {
            Self::StorageChange { app, .. } | Self::AppAvailabilityChanged { app, .. } => app,
        }
    }
}

/// What a subscriber asks to be told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SubscriptionRequest {
    /// Availability changes of every app. Local; no target app involved.
    AppAvailabilityChanged,
    /// Storage changes of `app`, optionally limited to some collections.
    StorageChange {
        /// Target app.
        app: String,
        /// Collections of interest; `None` means all.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collections: Option<Vec<String>>,
    },
}

impl SubscriptionRequest {
    /// Kind of events the request covers.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::AppAvailabilityChanged => EventKind::AppAvailabilityChanged,
            Self::StorageChange { .. } => EventKind::StorageChange,
        }
    }
}

/// Payload handed to a subscriber's `handleEvent` callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDelivery {
    /// Subscription the event is delivered for.
    pub subscription_id: SubscriptionId,
    /// The event.
    pub event: AppEvent,
}

/// Result of a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Subscription created.
    Success {
        /// Locally owned id of the new subscription.
        subscription_id: SubscriptionId,
    },
    /// The target app has no live session.
    AppNotFound,
    /// The target app lacks `handleSubscription` or declined.
    AppNotSupported,
}

impl SubscribeOutcome {
    /// Status string as seen on the wire.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::AppNotFound => "app-not-found",
            Self::AppNotSupported => "app-not-supported",
        }
    }

    /// Returns the id when the subscription was created.
    #[must_use]
    pub const fn subscription_id(&self) -> Option<SubscriptionId> {
        match self {
            Self::Success { subscription_id } => Some(*subscription_id),
            Self::AppNotFound | Self::AppNotSupported => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn availability_event_wire_format() {
        let event = AppEvent::AppAvailabilityChanged {
            app: "notes".to_string(),
            availability: false,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "app-availability-changed", "app": "notes", "availability": false})
        );
        assert_eq!(event.kind(), EventKind::AppAvailabilityChanged);
        assert_eq!(event.app(), "notes");
    }

    #[test]
    fn subscription_request_parses_collections() {
        let req: SubscriptionRequest = serde_json::from_value(json!({
            "event": "storage-change",
            "app": "src",
            "collections": ["tags"]
        }))
        .unwrap();
        assert_eq!(
            req,
            SubscriptionRequest::StorageChange {
                app: "src".to_string(),
                collections: Some(vec!["tags".to_string()]),
            }
        );
        assert_eq!(req.kind(), EventKind::StorageChange);
    }

    #[test]
    fn subscription_ids_parse_back() {
        let id = SubscriptionId::new();
        assert_eq!(SubscriptionId::parse(&id.to_string()), Some(id));
        assert_eq!(SubscriptionId::parse("not-a-uuid"), None);
    }
}
