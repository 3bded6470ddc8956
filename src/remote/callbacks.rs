//! Callback kinds a remote app may implement.
//!
//! Every callback has a closed reply type. A peer that does not implement a
//! callback answers `NotImplemented` through the trait's default method, so a
//! missing handler is an in-band value rather than an error.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{EventDelivery, SubscriptionRequest};
use crate::storage::Operation;

/// The closed set of callbacks the hub can dispatch to a remote app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallbackMethod {
    /// Run a storage operation on the peer's data.
    HandleRemoteOperation,
    /// Invoke a named call exposed by the peer.
    HandleRemoteCall,
    /// Deliver an event for one of the peer's subscriptions.
    HandleEvent,
    /// Ask the peer to allocate a subscription on its side.
    HandleSubscription,
    /// Ask the peer to release a subscription it allocated.
    HandleUnsubscription,
}

impl CallbackMethod {
    /// Wire name of the callback.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandleRemoteOperation => "handleRemoteOperation",
            Self::HandleRemoteCall => "handleRemoteCall",
            Self::HandleEvent => "handleEvent",
            Self::HandleSubscription => "handleSubscription",
            Self::HandleUnsubscription => "handleUnsubscription",
        }
    }
}

impl fmt::Display for CallbackMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of `handleRemoteOperation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOperationRequest {
    /// Operation to run against the peer's storage.
    pub operation: Operation,
    /// Identifier of the requesting app; empty when the hub itself asks.
    pub source_app: String,
}

/// Arguments of `handleRemoteCall`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCallRequest {
    /// Call name.
    pub call: String,
    /// Call arguments.
    #[serde(default)]
    pub args: Value,
}

/// Reply to `handleRemoteOperation`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RemoteOperationReply {
    Success { result: Value },
    NotAllowed,
    NotImplemented,
    Error { message: String },
}

impl RemoteOperationReply {
    /// Status string as seen on the wire.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::NotAllowed => "not-allowed",
            Self::NotImplemented => "not-implemented",
            Self::Error { .. } => "error",
        }
    }
}

/// Reply to `handleRemoteCall`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RemoteCallReply {
    Success { result: Value },
    CallNotFound,
    NotImplemented,
    InternalError { message: String },
}

impl RemoteCallReply {
    /// Status string as seen on the wire.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::CallNotFound => "call-not-found",
            Self::NotImplemented => "not-implemented",
            Self::InternalError { .. } => "internal-error",
        }
    }
}

/// Reply to `handleEvent`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum DeliveryReply {
    Success,
    NotImplemented,
    Error { message: String },
}

/// Reply to `handleSubscription`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SubscriptionReply {
    #[serde(rename_all = "camelCase")]
    Success { subscription_id: String },
    AppNotSupported,
    NotImplemented,
}

/// Reply to `handleUnsubscription`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum UnsubscriptionReply {
    Success,
    NotImplemented,
}

/// Handlers supplied by a remote app when it identifies itself.
///
/// Implement only the callbacks the app supports.
pub trait RemoteCallbacks: Send + Sync {
    /// Runs an operation against this app's storage on behalf of someone else.
    fn handle_remote_operation(&self, _request: RemoteOperationRequest) -> RemoteOperationReply {
        RemoteOperationReply::NotImplemented
    }

    /// Invokes a named call.
    fn handle_remote_call(&self, _request: RemoteCallRequest) -> RemoteCallReply {
        RemoteCallReply::NotImplemented
    }

    /// Receives an event for a subscription this app holds.
    fn handle_event(&self, _delivery: EventDelivery) -> DeliveryReply {
        DeliveryReply::NotImplemented
    }

    /// Allocates a subscription on this app's side.
    fn handle_subscription(&self, _request: SubscriptionRequest) -> SubscriptionReply {
        SubscriptionReply::NotImplemented
    }

    /// Releases a subscription previously allocated by [`Self::handle_subscription`].
    fn handle_unsubscription(&self, _subscription_id: String) -> UnsubscriptionReply {
        UnsubscriptionReply::NotImplemented
    }
}
