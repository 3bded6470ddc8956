//! App event bus: per-app listener tables, availability events and
//! subscription lifecycles.

mod bus;
mod dispatcher;
mod emitter;
mod types;

pub use bus::AppEventBus;
pub use emitter::{EventEmitter, Listener};
pub use types::{
    AppEvent, EventDelivery, EventKind, ListenerId, SubscribeOutcome, SubscriptionId,
    SubscriptionRequest,
};
