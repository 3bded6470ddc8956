//! Remote app sessions and callback dispatch.

mod callbacks;
mod registry;

pub use callbacks::{
    CallbackMethod, DeliveryReply, RemoteCallReply, RemoteCallRequest, RemoteCallbacks,
    RemoteOperationReply, RemoteOperationRequest, SubscriptionReply, UnsubscriptionReply,
};
pub use registry::{CallbackOutcome, RemoteSession, RemoteSessionRegistry};
