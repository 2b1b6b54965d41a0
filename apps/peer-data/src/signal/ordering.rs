//! Ordering layer: per-sender in-order delivery on top of a relay that may reorder, plus
//! the reconnect backoff for rooms reported as full.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use signal_bus::{EventBus, Subscription};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::envelope::{self, Inbound};
use super::sequence::{Admission, OutgoingSequence, SequenceTracker};
use super::transport::{RelayTransport, TransportEvent};
use super::{Signal, SignalEvent, SignalMessage, SignalState};
use crate::config::{ReorderPolicy, RetryPolicy, SignalConfig};
use crate::error::{Result, SignalError};

struct Core {
    state: SignalState,
    peer: Option<String>,
    /// Raw envelopes parked behind a gap, per sender.
    incoming: HashMap<String, SequenceTracker<String>>,
    outgoing: HashMap<String, OutgoingSequence>,
    retries: u32,
}

struct Shared {
    transport: Mutex<Option<Arc<dyn RelayTransport>>>,
    core: Mutex<Core>,
    events: EventBus<SignalEvent>,
    retry: RetryPolicy,
    reorder: ReorderPolicy,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Wraps a [`RelayTransport`]; must be created inside a tokio runtime.
pub struct OrderedSignal {
    shared: Arc<Shared>,
}

impl OrderedSignal {
    pub fn new(transport: Arc<dyn RelayTransport>, retry: RetryPolicy, reorder: ReorderPolicy) -> Self {
        let inbound = transport.subscribe();
        let sweep = reorder.sweep_interval();
        let shared = Arc::new(Shared {
            transport: Mutex::new(Some(transport)),
            core: Mutex::new(Core {
                state: SignalState::New,
                peer: None,
                incoming: HashMap::new(),
                outgoing: HashMap::new(),
                retries: 0,
            }),
            events: EventBus::new(),
            retry,
            reorder,
            pump: Mutex::new(None),
        });
        let handle = tokio::spawn(pump(Arc::downgrade(&shared), inbound, sweep));
        *shared.pump.lock() = Some(handle);
        Self { shared }
    }

    pub fn from_config(transport: Arc<dyn RelayTransport>, config: &SignalConfig) -> Self {
        Self::new(transport, config.retry.clone(), config.reorder.clone())
    }

    /// Reconnect attempts made since the last `open`.
    pub fn retries(&self) -> u32 {
        self.shared.core.lock().retries
    }
}

impl Drop for OrderedSignal {
    fn drop(&mut self) {
        if let Some(pump) = self.shared.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn pump(shared: Weak<Shared>, mut inbound: Subscription<TransportEvent>, sweep: Duration) {
    let mut ticker = tokio::time::interval(sweep);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = inbound.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                match event {
                    Some(event) => {
                        if !shared.on_transport(event) {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!(target = "signal", "transport event stream ended");
                        shared.finalize();
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                shared.sweep_gaps();
            }
        }
    }
}

async fn retry_join(shared: Weak<Shared>, attempt: u32, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(shared) = shared.upgrade() else { return };
    let transport = {
        let mut core = shared.core.lock();
        if core.state != SignalState::Open || core.retries != attempt {
            tracing::debug!(target = "signal", attempt, state = %core.state, "stale reconnect timer");
            return;
        }
        core.retries += 1;
        shared.transport.lock().clone()
    };
    let Some(transport) = transport else { return };
    tracing::debug!(target = "signal", attempt, "requesting reconnect");
    let message = envelope::reconnect_request().to_string();
    if let Err(err) = transport.send(message, None).await {
        tracing::warn!(target = "signal", attempt, error = %err, "reconnect request failed");
        shared.events.emit(SignalEvent::Error(err));
    }
}

impl Shared {
    fn accepting(&self) -> bool {
        matches!(
            self.core.lock().state,
            SignalState::Opening | SignalState::Open
        )
    }

    fn transport(&self) -> Result<Arc<dyn RelayTransport>> {
        self.transport.lock().clone().ok_or(SignalError::Closed)
    }

    /// Returns false once the transport has closed.
    fn on_transport(self: &Arc<Self>, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Open { peer } => {
                let mut core = self.core.lock();
                if core.state != SignalState::Opening {
                    tracing::debug!(target = "signal", state = %core.state, "ignoring transport open");
                    return true;
                }
                core.state = SignalState::Open;
                core.peer = Some(peer.clone());
                core.incoming.clear();
                core.outgoing.clear();
                tracing::info!(target = "signal", peer = %peer, "signal open");
                self.events.emit(SignalEvent::Open { peer });
            }
            TransportEvent::Message(raw) => {
                if self.accepting() {
                    self.process_inbound(raw);
                } else {
                    tracing::debug!(target = "signal", "dropping message received while not open");
                }
            }
            TransportEvent::Turn(servers) => {
                if self.accepting() {
                    for server in servers {
                        self.events.emit(SignalEvent::Turn(server));
                    }
                }
            }
            TransportEvent::Error(reason) => {
                tracing::warn!(target = "signal", error = %reason, "relay transport error");
                self.events
                    .emit(SignalEvent::Error(SignalError::Transport(reason)));
            }
            TransportEvent::Close => {
                self.finalize();
                return false;
            }
        }
        true
    }

    /// Deliver `raw` and then whatever it unblocks, one parked envelope per pass.
    fn process_inbound(self: &Arc<Self>, raw: String) {
        let mut queue = VecDeque::from([raw]);
        while let Some(raw) = queue.pop_front() {
            if let Some(next) = self.route(raw) {
                queue.push_back(next);
            }
        }
    }

    fn route(self: &Arc<Self>, raw: String) -> Option<String> {
        let inbound = match envelope::classify(&raw) {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::warn!(target = "signal", error = %err, "dropping malformed envelope");
                self.events.emit(SignalEvent::Error(err));
                return None;
            }
        };

        let mut core = self.core.lock();
        match inbound {
            Inbound::Presence { peer, envelope } => {
                if core.peer.as_deref() == Some(peer.as_str()) {
                    tracing::debug!(target = "signal", peer = %peer, "ignoring presence for ourselves");
                } else {
                    self.emit_message(envelope, None, None);
                }
                None
            }
            Inbound::Full(envelope) => {
                if core.retries < self.retry.max_attempts {
                    let attempt = core.retries;
                    let delay = self.retry.delay(attempt, &mut rand::thread_rng());
                    tracing::info!(
                        target = "signal",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "room full, scheduling reconnect"
                    );
                    tokio::spawn(retry_join(Arc::downgrade(self), attempt, delay));
                } else {
                    tracing::warn!(target = "signal", attempts = core.retries, "room still full, giving up");
                    self.emit_message(envelope, None, None);
                }
                None
            }
            Inbound::Data {
                from,
                seq: None,
                payload,
            } => {
                self.emit_message(Value::Object(payload), Some(from), None);
                None
            }
            Inbound::Data {
                from,
                seq: Some(seq),
                payload,
            } => {
                let max_pending = self.reorder.max_pending;
                let tracker = core.incoming.entry(from.clone()).or_default();
                match tracker.admit(seq, raw, max_pending, Instant::now()) {
                    Admission::Deliver(_) => {
                        let next = tracker.take_next().map(|(_, raw)| raw);
                        self.emit_message(Value::Object(payload), Some(from), Some(seq));
                        next
                    }
                    Admission::Duplicate => {
                        tracing::debug!(
                            target = "signal",
                            peer = %from,
                            seq,
                            last = tracker.last_delivered(),
                            "dropping stale or duplicate message"
                        );
                        None
                    }
                    Admission::Buffered { pending } => {
                        tracing::trace!(target = "signal", peer = %from, seq, pending, "parked message behind gap");
                        None
                    }
                    Admission::Overflow { limit } => {
                        tracing::warn!(target = "signal", peer = %from, seq, limit, "reorder buffer full");
                        self.events.emit(SignalEvent::Error(SignalError::ReorderOverflow {
                            peer: from,
                            limit,
                            seq,
                        }));
                        None
                    }
                }
            }
        }
    }

    fn emit_message(&self, payload: Value, from: Option<String>, seq: Option<u64>) {
        self.events
            .emit(SignalEvent::Message(SignalMessage { payload, from, seq }));
    }

    fn sweep_gaps(self: &Arc<Self>) {
        let now = Instant::now();
        let mut resumed = Vec::new();
        {
            let mut core = self.core.lock();
            if core.state != SignalState::Open {
                return;
            }
            for (peer, tracker) in core.incoming.iter_mut() {
                let Some(skip) = tracker.expire(now, self.reorder.gap_timeout) else {
                    continue;
                };
                tracing::warn!(
                    target = "signal",
                    peer = %peer,
                    expected = skip.expected,
                    resume_at = skip.resume_at,
                    "giving up on sequence gap"
                );
                self.events.emit(SignalEvent::Error(SignalError::GapTimeout {
                    peer: peer.clone(),
                    expected: skip.expected,
                    waited: skip.waited,
                }));
                if let Some((_, raw)) = tracker.take_next() {
                    resumed.push(raw);
                }
            }
        }
        for raw in resumed {
            self.process_inbound(raw);
        }
    }

    /// Release the transport and emit `Close`, once.
    fn finalize(&self) {
        let pump = {
            let mut core = self.core.lock();
            if core.state == SignalState::Closed {
                return;
            }
            core.state = SignalState::Closed;
            core.incoming.clear();
            core.outgoing.clear();
            self.transport.lock().take();
            tracing::info!(target = "signal", "signal closed");
            self.events.emit(SignalEvent::Close);
            self.pump.lock().take()
        };
        self.events.close();
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

#[async_trait]
impl Signal for OrderedSignal {
    fn state(&self) -> SignalState {
        self.shared.core.lock().state
    }

    fn local_peer(&self) -> Option<String> {
        self.shared.core.lock().peer.clone()
    }

    fn subscribe(&self) -> Subscription<SignalEvent> {
        self.shared.events.subscribe()
    }

    async fn open(&self) -> Result<()> {
        let transport = {
            let mut core = self.shared.core.lock();
            if core.state != SignalState::New {
                tracing::warn!(target = "signal", state = %core.state, "signal already opened or closed");
                return Err(core.state.invalid("open"));
            }
            core.state = SignalState::Opening;
            core.retries = 0;
            self.shared.transport()?
        };
        tracing::debug!(target = "signal", "opening signal");
        if let Err(err) = transport.open().await {
            tracing::warn!(target = "signal", error = %err, "signal failed to open");
            self.shared.events.emit(SignalEvent::Error(err.clone()));
            self.shared.finalize();
            return Err(err);
        }
        Ok(())
    }

    async fn send(&self, payload: Value, to: Option<&str>) -> Result<()> {
        let (transport, message) = {
            let mut core = self.shared.core.lock();
            if core.state != SignalState::Open {
                return Err(core.state.invalid("send"));
            }
            let seq = to.map(|peer| core.outgoing.entry(peer.to_string()).or_default().peek());
            let message = envelope::stamp(payload, seq)?;
            if let Some(peer) = to {
                if let Some(outgoing) = core.outgoing.get_mut(peer) {
                    outgoing.advance();
                }
            }
            (self.shared.transport()?, message)
        };
        if let Err(err) = transport.send(message, to).await {
            tracing::warn!(target = "signal", error = %err, "relay send failed");
            self.shared.events.emit(SignalEvent::Error(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let transport = {
            let mut core = self.shared.core.lock();
            match core.state {
                SignalState::Closing | SignalState::Closed => {
                    tracing::debug!(target = "signal", state = %core.state, "signal already closing");
                    return Ok(());
                }
                SignalState::New => None,
                SignalState::Opening | SignalState::Open => {
                    core.state = SignalState::Closing;
                    self.shared.transport.lock().clone()
                }
            }
        };
        let result = match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        };
        if let Err(err) = &result {
            tracing::warn!(target = "signal", error = %err, "relay close failed");
        }
        self.shared.finalize();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::mock::MockRelay;
    use crate::signal::transport::TurnServer;
    use serde_json::json;

    async fn next_event(sub: &mut Subscription<SignalEvent>) -> SignalEvent {
        tokio::time::timeout(Duration::from_secs(30), sub.recv())
            .await
            .expect("timed out waiting for signal event")
            .expect("signal event stream ended")
    }

    async fn next_message(sub: &mut Subscription<SignalEvent>) -> SignalMessage {
        loop {
            if let SignalEvent::Message(message) = next_event(sub).await {
                return message;
            }
        }
    }

    async fn opened(relay: &Arc<MockRelay>, reorder: ReorderPolicy) -> (OrderedSignal, Subscription<SignalEvent>) {
        let signal = OrderedSignal::new(relay.clone(), RetryPolicy::default(), reorder);
        let mut sub = signal.subscribe();
        signal.open().await.unwrap();
        assert_eq!(
            next_event(&mut sub).await,
            SignalEvent::Open {
                peer: "me".to_string()
            }
        );
        (signal, sub)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn presence_for_self_is_suppressed() {
        let relay = MockRelay::new("me");
        let (signal, mut sub) = opened(&relay, ReorderPolicy::default()).await;
        assert_eq!(signal.local_peer().as_deref(), Some("me"));

        relay.deliver_presence("connected", "me");
        relay.deliver_presence("connected", "other");
        let message = next_message(&mut sub).await;
        assert_eq!(message.payload, json!({"type": "connected", "peer": "other"}));
        assert_eq!(message.from, None);
        assert!(sub.drain().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn reorders_per_sender() {
        let relay = MockRelay::new("me");
        let (_signal, mut sub) = opened(&relay, ReorderPolicy::default()).await;

        relay.deliver_from("a", json!({"seq": 2, "n": 2}));
        relay.deliver_from("b", json!({"seq": 0, "n": 0}));
        relay.deliver_from("a", json!({"seq": 1, "n": 1}));
        relay.deliver_from("a", json!({"seq": 0, "n": 0}));
        relay.deliver_from("a", json!({"seq": 1, "n": 1}));

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        for _ in 0..4 {
            let message = next_message(&mut sub).await;
            assert_eq!(message.payload.get("seq"), None);
            assert_eq!(message.payload["n"].as_u64(), message.seq);
            match message.from.as_deref() {
                Some("a") => from_a.push(message.seq.unwrap()),
                Some("b") => from_b.push(message.seq.unwrap()),
                other => panic!("unexpected sender {other:?}"),
            }
        }
        assert_eq!(from_a, vec![0, 1, 2]);
        assert_eq!(from_b, vec![0]);
        tokio::task::yield_now().await;
        assert!(sub.drain().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unicast_sends_are_sequenced_per_destination() {
        let relay = MockRelay::new("me");
        let (signal, _sub) = opened(&relay, ReorderPolicy::default()).await;

        signal.send(json!({"type": "offer"}), Some("p1")).await.unwrap();
        signal.send(json!({"type": "offer"}), Some("p1")).await.unwrap();
        signal.send(json!({"type": "offer"}), Some("p2")).await.unwrap();
        signal.send(json!({"type": "hello"}), None).await.unwrap();
        assert!(matches!(
            signal.send(json!("bare"), Some("p1")).await,
            Err(SignalError::InvalidMessage(_))
        ));
        signal.send(json!({"type": "answer"}), Some("p1")).await.unwrap();

        let sent = relay.sent();
        let seqs: Vec<(Option<String>, Option<u64>)> = sent
            .iter()
            .map(|sent| (sent.to.clone(), sent.json()["seq"].as_u64()))
            .collect();
        assert_eq!(
            seqs,
            vec![
                (Some("p1".into()), Some(0)),
                (Some("p1".into()), Some(1)),
                (Some("p2".into()), Some(0)),
                (None, None),
                (Some("p1".into()), Some(2)),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn invalid_states_are_rejected() {
        let relay = MockRelay::new("me");
        let signal = OrderedSignal::new(relay.clone(), RetryPolicy::default(), ReorderPolicy::default());
        assert!(matches!(
            signal.send(json!({}), None).await,
            Err(SignalError::State { operation: "send", state: "new" })
        ));
        signal.open().await.unwrap();
        assert!(matches!(
            signal.open().await,
            Err(SignalError::State { operation: "open", .. })
        ));
        assert_eq!(relay.open_calls(), 1);
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn sixth_full_is_forwarded() {
        let relay = MockRelay::new("me");
        let (signal, mut sub) = opened(&relay, ReorderPolicy::default()).await;

        for attempt in 0..5u32 {
            relay.deliver(r#"{"type":"full"}"#);
            tokio::time::sleep(Duration::from_secs(20)).await;
            let sent = relay.sent();
            assert_eq!(sent.len(), attempt as usize + 1);
            let last = sent.last().unwrap();
            assert_eq!(last.to, None);
            assert_eq!(last.json(), json!({"type": "reconnect"}));
            assert_eq!(signal.retries(), attempt + 1);
        }
        assert!(sub.drain().is_empty());

        relay.deliver(r#"{"type":"full"}"#);
        let message = next_message(&mut sub).await;
        assert_eq!(message.kind(), Some("full"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(relay.sent().len(), 5);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn reconnect_timer_is_stale_after_close() {
        let relay = MockRelay::new("me");
        let (signal, _sub) = opened(&relay, ReorderPolicy::default()).await;
        relay.deliver(r#"{"type":"full"}"#);
        tokio::task::yield_now().await;
        signal.close().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(relay.sent().is_empty());
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn gap_timeout_skips_ahead() {
        let relay = MockRelay::new("me");
        let reorder = ReorderPolicy {
            max_pending: 8,
            gap_timeout: Duration::from_secs(2),
        };
        let (_signal, mut sub) = opened(&relay, reorder).await;

        relay.deliver_from("a", json!({"seq": 2}));
        relay.deliver_from("a", json!({"seq": 3}));
        match next_event(&mut sub).await {
            SignalEvent::Error(SignalError::GapTimeout { peer, expected, waited }) => {
                assert_eq!(peer, "a");
                assert_eq!(expected, 0);
                assert!(waited >= Duration::from_secs(2));
            }
            other => panic!("expected gap timeout, got {other:?}"),
        }
        assert_eq!(next_message(&mut sub).await.seq, Some(2));
        assert_eq!(next_message(&mut sub).await.seq, Some(3));

        // the skipped numbers are now stale
        relay.deliver_from("a", json!({"seq": 1}));
        relay.deliver_from("a", json!({"seq": 4}));
        assert_eq!(next_message(&mut sub).await.seq, Some(4));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn overflow_reports_and_drops() {
        let relay = MockRelay::new("me");
        let reorder = ReorderPolicy {
            max_pending: 2,
            gap_timeout: Duration::from_secs(60),
        };
        let (_signal, mut sub) = opened(&relay, reorder).await;

        for seq in [1, 2, 3] {
            relay.deliver_from("a", json!({"seq": seq}));
        }
        assert_eq!(
            next_event(&mut sub).await,
            SignalEvent::Error(SignalError::ReorderOverflow {
                peer: "a".into(),
                limit: 2,
                seq: 3
            })
        );
        relay.deliver_from("a", json!({"seq": 0}));
        let delivered: Vec<_> = [
            next_message(&mut sub).await.seq,
            next_message(&mut sub).await.seq,
            next_message(&mut sub).await.seq,
        ]
        .into_iter()
        .collect();
        assert_eq!(delivered, vec![Some(0), Some(1), Some(2)]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn malformed_envelope_reports_and_continues() {
        let relay = MockRelay::new("me");
        let (signal, mut sub) = opened(&relay, ReorderPolicy::default()).await;

        relay.deliver("{not json");
        assert!(matches!(
            next_event(&mut sub).await,
            SignalEvent::Error(SignalError::Protocol(_))
        ));
        relay.deliver_from("a", json!({"seq": 0, "ok": true}));
        assert_eq!(next_message(&mut sub).await.payload, json!({"ok": true}));
        assert_eq!(signal.state(), SignalState::Open);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn turn_lists_are_emitted_individually() {
        let relay = MockRelay::new("me");
        let (_signal, mut sub) = opened(&relay, ReorderPolicy::default()).await;
        relay.deliver_turn(vec![TurnServer::new("turn:a"), TurnServer::new("turn:b")]);
        assert_eq!(next_event(&mut sub).await, SignalEvent::Turn(TurnServer::new("turn:a")));
        assert_eq!(next_event(&mut sub).await, SignalEvent::Turn(TurnServer::new("turn:b")));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn close_is_emitted_once() {
        let relay = MockRelay::new("me");
        let (signal, mut sub) = opened(&relay, ReorderPolicy::default()).await;

        signal.close().await.unwrap();
        signal.close().await.unwrap();
        assert_eq!(signal.state(), SignalState::Closed);
        assert_eq!(relay.close_calls(), 1);
        assert_eq!(next_event(&mut sub).await, SignalEvent::Close);
        assert_eq!(sub.recv().await, None);
        assert!(matches!(
            signal.send(json!({}), None).await,
            Err(SignalError::State { state: "closed", .. })
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failed_open_closes_without_open_event() {
        let relay = MockRelay::new("me");
        relay.fail_open("connection refused");
        let signal = OrderedSignal::new(relay.clone(), RetryPolicy::default(), ReorderPolicy::default());
        let mut sub = signal.subscribe();

        assert_eq!(
            signal.open().await,
            Err(SignalError::Transport("connection refused".into()))
        );
        assert_eq!(signal.state(), SignalState::Closed);
        let events = sub.drain();
        assert_eq!(
            events,
            vec![
                SignalEvent::Error(SignalError::Transport("connection refused".into())),
                SignalEvent::Close
            ]
        );
    }
}
