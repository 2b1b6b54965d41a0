//! Typed event buses for the signaling stack.
//!
//! Each component owns an [`EventBus`] for its own event type. Subscribing returns a
//! [`Subscription`] that both receives events and acts as the disposer: dropping it (or
//! calling [`Subscription::dispose`]) detaches the listener from the bus.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus closed")]
    Closed,
    #[error("no event available")]
    Empty,
}

pub type BusResult<T> = Result<T, BusError>;

struct Listener<E> {
    id: u64,
    sender: mpsc::UnboundedSender<E>,
}

struct Listeners<E> {
    next_id: u64,
    closed: bool,
    entries: Vec<Listener<E>>,
}

impl<E> Listeners<E> {
    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|listener| listener.id != id);
        before != self.entries.len()
    }
}

/// Fan-out bus delivering every emitted event to each live subscription, in emit order.
pub struct EventBus<E> {
    listeners: Arc<Mutex<Listeners<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                closed: false,
                entries: Vec::new(),
            })),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new listener. Events emitted before this call are not replayed.
    pub fn subscribe(&self) -> Subscription<E> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut guard = self.listeners.lock();
        let id = guard.next_id;
        guard.next_id += 1;
        if !guard.closed {
            guard.entries.push(Listener { id, sender });
        }
        Subscription {
            id,
            receiver,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver `event` to every live subscription. Returns how many listeners received it.
    pub fn emit(&self, event: E) -> usize {
        let mut guard = self.listeners.lock();
        if guard.closed {
            return 0;
        }
        guard
            .entries
            .retain(|listener| listener.sender.send(event.clone()).is_ok());
        guard.entries.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Detach every listener. Pending events stay readable; afterwards `recv` yields `None`.
    pub fn close(&self) {
        let mut guard = self.listeners.lock();
        guard.closed = true;
        guard.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.listeners.lock().closed
    }
}

/// Receiving end of an [`EventBus`] listener; detaches from the bus when dropped.
pub struct Subscription<E> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<E>,
    listeners: Weak<Mutex<Listeners<E>>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event. `None` once the bus is closed (or dropped) and drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> BusResult<E> {
        self.receiver.try_recv().map_err(|err| match err {
            mpsc::error::TryRecvError::Empty => BusError::Empty,
            mpsc::error::TryRecvError::Disconnected => BusError::Closed,
        })
    }

    /// Drain everything that is already queued without waiting.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Explicit teardown; equivalent to dropping the subscription.
    pub fn dispose(self) {}

    fn detach(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().remove(self.id);
        }
        self.receiver.close();
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.detach();
    }
}
