use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use signal_bus::{EventBus, Subscription};

use super::transport::{RelayTransport, TransportEvent, TurnServer};
use crate::error::{Result, SignalError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: Option<String>,
    pub message: String,
}

impl SentMessage {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.message).unwrap_or(Value::Null)
    }
}

/// In-memory relay. Tests push inbound envelopes with [`MockRelay::deliver`] and inspect
/// what the stack sent with [`MockRelay::sent`].
pub struct MockRelay {
    peer: String,
    events: EventBus<TransportEvent>,
    sent: Mutex<Vec<SentMessage>>,
    open_failure: Mutex<Option<String>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl MockRelay {
    /// A relay that assigns `peer` when opened.
    pub fn new(peer: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.into(),
            events: EventBus::new(),
            sent: Mutex::new(Vec::new()),
            open_failure: Mutex::new(None),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn fail_open(&self, reason: impl Into<String>) {
        *self.open_failure.lock() = Some(reason.into());
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    pub fn deliver(&self, raw: impl Into<String>) {
        self.emit(TransportEvent::Message(raw.into()));
    }

    /// Deliver `payload` the way the relay forwards a peer message: `{from, data}` with the
    /// payload JSON-encoded inside `data`.
    pub fn deliver_from(&self, from: &str, payload: Value) {
        let envelope = serde_json::json!({ "from": from, "data": payload.to_string() });
        self.deliver(envelope.to_string());
    }

    pub fn deliver_presence(&self, kind: &str, peer: &str) {
        self.deliver(serde_json::json!({ "type": kind, "peer": peer }).to_string());
    }

    pub fn deliver_turn(&self, servers: Vec<TurnServer>) {
        self.emit(TransportEvent::Turn(servers));
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn open_calls(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayTransport for MockRelay {
    async fn open(&self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.open_failure.lock().clone() {
            return Err(SignalError::Transport(reason));
        }
        self.emit(TransportEvent::Open {
            peer: self.peer.clone(),
        });
        Ok(())
    }

    async fn send(&self, message: String, to: Option<&str>) -> Result<()> {
        self.sent.lock().push(SentMessage {
            to: to.map(str::to_string),
            message,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.emit(TransportEvent::Close);
        Ok(())
    }

    fn subscribe(&self) -> Subscription<TransportEvent> {
        self.events.subscribe()
    }
}
