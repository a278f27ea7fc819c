//! Fan-out of bridge events to any number of subscribers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use lnbridge::EventSink;

type Subscribers<E> = Mutex<Vec<mpsc::UnboundedSender<E>>>;

/// Delivers each emitted event to every current subscriber.
///
/// Every subscriber has its own unbounded queue, so a slow reader never
/// loses events and never holds up the producer. Events emitted while nobody
/// is subscribed are dropped. Clones share the same subscribers.
#[derive(Debug)]
pub struct EventHub<E> {
    subscribers: Arc<Subscribers<E>>,
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    /// Create a hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event emitted from now on.
    ///
    /// Dropping the receiver unsubscribes on the next emit.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Disconnect every subscriber; their receivers end once drained.
    pub fn close(&self) {
        let closed = std::mem::take(&mut *self.lock());
        if !closed.is_empty() {
            tracing::debug!(subscribers = closed.len(), "Closed event feed");
        }
    }

    /// Number of subscribers still registered.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Clone + Send + 'static> EventSink<E> for EventHub<E> {
    fn emit(&self, event: E) {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        let dropped = before - subscribers.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = subscribers.len(), "Dropped closed event subscribers");
        }
    }
}
