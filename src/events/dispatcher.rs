//! Fire-and-forget dispatch worker.
//!
//! Emitters enqueue a listener snapshot plus the event onto a bounded channel
//! with `try_send` and return immediately. A single worker thread drains the
//! queue in FIFO order. A full queue drops the event and bumps a counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

use super::emitter::Listener;
use super::types::AppEvent;

struct DispatchMsg {
    listeners: Vec<Listener>,
    event: AppEvent,
}

/// Owns the dispatch worker thread.
pub(crate) struct EventDispatcher {
    tx: Sender<DispatchMsg>,
    capacity: usize,
    dropped: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub(crate) fn start(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded::<DispatchMsg>(capacity);
        let join = thread::Builder::new()
            .name("apphub-events".to_string())
            .spawn(move || worker_loop(&rx))
            .expect("failed to spawn apphub event dispatcher");
        Self {
            tx,
            capacity,
            dropped: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
        }
    }

    /// Non-blocking enqueue.
    pub(crate) fn dispatch(&self, listeners: Vec<Listener>, event: AppEvent) {
        if listeners.is_empty() {
            return;
        }
        match self.tx.try_send(DispatchMsg { listeners, event }) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = %msg.event.kind(),
                    capacity = self.capacity,
                    "event dispatch queue full; event dropped"
                );
            }
            Err(TrySendError::Disconnected(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = %msg.event.kind(), "event dispatcher gone; event dropped");
            }
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        // Close the channel so the worker exits after draining.
        let (dummy_tx, _) = bounded::<DispatchMsg>(1);
        drop(std::mem::replace(&mut self.tx, dummy_tx));

        // Detach: a listener may hold the last handle to the bus, in which
        // case this drop runs on the worker itself and joining would deadlock.
        if let Ok(mut guard) = self.join.lock() {
            drop(guard.take());
        }
    }
}

fn worker_loop(rx: &Receiver<DispatchMsg>) {
    while let Ok(DispatchMsg { listeners, event }) = rx.recv() {
        for listener in listeners {
            if let Err(err) = listener(&event) {
                warn!(event = %event.kind(), app = %event.app(), error = %err, "listener failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn availability(app: &str) -> AppEvent {
        AppEvent::AppAvailabilityChanged {
            app: app.to_string(),
            availability: true,
        }
    }

    #[test]
    fn delivers_in_fifo_order() {
        let dispatcher = EventDispatcher::start(16);
        let (tx, rx) = crossbeam_channel::unbounded();
        let listener: Listener = Arc::new(move |event: &AppEvent| {
            tx.send(event.app().to_string()).unwrap();
            Ok(())
        });

        for app in ["a", "b", "c"] {
            dispatcher.dispatch(vec![Arc::clone(&listener)], availability(app));
        }
        let got: Vec<String> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, vec!["a", "b", "c"]);
        assert_eq!(dispatcher.dropped(), 0);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let dispatcher = EventDispatcher::start(1);
        let (block_tx, block_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let blocker: Listener = Arc::new(move |_: &AppEvent| {
            let _ = started_tx.try_send(());
            let _ = block_rx.recv();
            Ok(())
        });

        dispatcher.dispatch(vec![Arc::clone(&blocker)], availability("busy"));
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // Worker is blocked: one message fits, the next is dropped.
        let noop: Listener = Arc::new(|_: &AppEvent| Ok(()));
        dispatcher.dispatch(vec![Arc::clone(&noop)], availability("queued"));
        dispatcher.dispatch(vec![noop], availability("dropped"));
        assert_eq!(dispatcher.dropped(), 1);

        drop(block_tx);
    }
}
