//! Listener tables.

use std::fmt;
use std::sync::Arc;

use crate::error::HubResult;

use super::types::{AppEvent, EventKind, ListenerId};

/// A registered event listener.
pub type Listener = Arc<dyn Fn(&AppEvent) -> HubResult<()> + Send + Sync>;

/// Ordered listener table for one app (or the global availability table).
///
/// Listeners are kept in registration order. The emitter does not invoke
/// anything itself; callers take a snapshot and run it outside their lock.
#[derive(Default)]
pub struct EventEmitter {
    listeners: Vec<(ListenerId, EventKind, Listener)>,
}

impl EventEmitter {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener for `kind`.
    pub fn on(&mut self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.push((id, kind, listener));
        id
    }

    /// Removes a listener; returns false if it was not registered.
    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _, _)| *lid != id);
        before != self.listeners.len()
    }

    /// Listeners for `kind`, in registration order.
    #[must_use]
    pub fn listeners_for(&self, kind: EventKind) -> Vec<Listener> {
        self.listeners
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, l)| Arc::clone(l))
            .collect()
    }

    /// Drops every listener.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    /// Number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns true if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
