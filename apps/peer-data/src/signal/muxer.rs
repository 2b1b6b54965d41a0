//! Moves peer-addressed signaling onto a direct data link once one is open, keeping the
//! wrapped signal as fallback and as the only path for presence.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use signal_bus::{EventBus, Subscription};
use tokio::task::JoinHandle;

use super::{Signal, SignalEvent, SignalMessage, SignalState};
use crate::error::{Result, SignalError};
use crate::negotiation::{Negotiator, PeerDirectory, PeerEvent, PeerHandle};
use crate::rtc::{self, ConnectionEvent, DataLink, LinkEvent, LinkOptions, LinkPayload, LinkState};

/// Reserved label of the per-peer signaling link. Channel labels cannot contain ':'.
pub const SIGNAL_LABEL: &str = "peer-data:signalling";

#[derive(Default)]
struct Route {
    send: Option<Arc<dyn DataLink>>,
    recv: Option<Arc<dyn DataLink>>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Arc<dyn Signal>,
    events: EventBus<SignalEvent>,
    routes: Mutex<HashMap<String, Route>>,
    directory: Mutex<Option<PeerDirectory>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct SignalMuxer {
    shared: Arc<Shared>,
}

impl SignalMuxer {
    /// Wrap `inner`. Must be created inside a tokio runtime, before `inner` opens.
    pub fn new(inner: Arc<dyn Signal>) -> Self {
        let inbound = inner.subscribe();
        let shared = Arc::new(Shared {
            inner,
            events: EventBus::new(),
            routes: Mutex::new(HashMap::new()),
            directory: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        let forward = tokio::spawn(forward(Arc::downgrade(&shared), inbound));
        shared.tasks.lock().push(forward);
        Self { shared }
    }

    /// Follow `negotiator`'s peers: open a signaling link to each connected peer and drop it
    /// when the peer leaves.
    pub fn attach(&self, negotiator: &Negotiator) {
        let events = negotiator.subscribe();
        *self.shared.directory.lock() = Some(negotiator.peers());
        let existing = negotiator.peers().handles();
        let task = tokio::spawn(follow_peers(Arc::downgrade(&self.shared), existing, events));
        self.shared.tasks.lock().push(task);
    }

    /// Whether sends to `peer` currently bypass the relay.
    pub fn has_direct_route(&self, peer: &str) -> bool {
        self.shared.direct_link(peer).is_some()
    }
}

impl Drop for SignalMuxer {
    fn drop(&mut self) {
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        for (_, route) in self.shared.routes.lock().drain() {
            if let Some(task) = route.task {
                task.abort();
            }
        }
    }
}

async fn forward(shared: Weak<Shared>, mut inbound: Subscription<SignalEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        let closing = matches!(event, SignalEvent::Close);
        shared.events.emit(event);
        if closing {
            shared.events.close();
            break;
        }
    }
}

async fn follow_peers(shared: Weak<Shared>, existing: Vec<PeerHandle>, mut events: Subscription<PeerEvent>) {
    for handle in existing {
        let Some(shared) = shared.upgrade() else { return };
        shared.open_route(handle).await;
    }
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        match event {
            PeerEvent::Connected(handle) => shared.open_route(handle).await,
            PeerEvent::Disconnected(handle) => shared.close_route(&handle.id).await,
            PeerEvent::Close => {
                let peers: Vec<String> = shared.routes.lock().keys().cloned().collect();
                for peer in peers {
                    shared.close_route(&peer).await;
                }
                break;
            }
            _ => {}
        }
    }
}

/// Adopt the remote side's signaling link and re-emit what arrives on it.
async fn receive_route(shared: Weak<Shared>, peer: String, mut connection_events: Subscription<ConnectionEvent>, existing: Option<Arc<dyn DataLink>>) {
    let link = match existing {
        Some(link) => link,
        None => loop {
            match connection_events.recv().await {
                Some(ConnectionEvent::DataLink(link)) if link.label() == SIGNAL_LABEL => break link,
                Some(_) => continue,
                None => return,
            }
        },
    };
    drop(connection_events);
    let mut link_events = link.subscribe();
    {
        let Some(shared) = shared.upgrade() else { return };
        match shared.routes.lock().get_mut(&peer) {
            Some(route) => route.recv = Some(Arc::clone(&link)),
            None => return,
        }
    }
    tracing::debug!(target = "signal", peer = %peer, "adopted direct signaling link");

    while let Some(event) = link_events.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        match event {
            LinkEvent::Message(payload) => shared.on_direct(&peer, payload),
            LinkEvent::Close => break,
            LinkEvent::Error(reason) => {
                tracing::warn!(target = "signal", peer = %peer, error = %reason, "direct signaling link error");
            }
            LinkEvent::Open => {}
        }
    }
}

impl Shared {
    fn direct_link(&self, peer: &str) -> Option<Arc<dyn DataLink>> {
        self.routes
            .lock()
            .get(peer)
            .and_then(|route| route.send.clone())
            .filter(|link| link.state() == LinkState::Open)
    }

    async fn open_route(self: &Arc<Self>, handle: PeerHandle) {
        {
            let mut routes = self.routes.lock();
            if routes.contains_key(&handle.id) {
                tracing::warn!(target = "signal", peer = %handle.id, "peer already has a signaling link");
                return;
            }
            routes.insert(handle.id.clone(), Route::default());
        }

        let connection_events = handle.connection.subscribe();
        let existing = rtc::find_remote_link(handle.connection.as_ref(), SIGNAL_LABEL);
        let task = tokio::spawn(receive_route(
            Arc::downgrade(self),
            handle.id.clone(),
            connection_events,
            existing,
        ));

        let send = match handle
            .connection
            .create_data_link(SIGNAL_LABEL, LinkOptions::default())
            .await
        {
            Ok(link) => Some(link),
            Err(err) => {
                tracing::warn!(target = "signal", peer = %handle.id, error = %err, "could not create signaling link");
                None
            }
        };

        let orphan = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&handle.id) {
                Some(route) => {
                    route.send = send;
                    route.task = Some(task);
                    None
                }
                None => {
                    task.abort();
                    send
                }
            }
        };
        // the peer left while the link was being created
        if let Some(link) = orphan {
            if let Err(err) = link.close().await {
                tracing::debug!(target = "signal", peer = %handle.id, error = %err, "closing orphaned signaling link");
            }
        }
    }

    async fn close_route(&self, peer: &str) {
        let Some(route) = self.routes.lock().remove(peer) else { return };
        if let Some(task) = route.task {
            task.abort();
        }
        for link in [route.send, route.recv].into_iter().flatten() {
            if link.state() == LinkState::Open {
                if let Err(err) = link.close().await {
                    tracing::debug!(target = "signal", peer = %peer, error = %err, "closing signaling link");
                }
            }
        }
        tracing::debug!(target = "signal", peer = %peer, "dropped signaling route");
    }

    fn on_direct(&self, peer: &str, payload: LinkPayload) {
        let text = match payload {
            LinkPayload::Text(text) => text,
            LinkPayload::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    self.protocol_error(peer, err.to_string());
                    return;
                }
            },
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(payload) => {
                self.events.emit(SignalEvent::Message(SignalMessage {
                    payload,
                    from: Some(peer.to_string()),
                    seq: None,
                }));
            }
            Err(err) => self.protocol_error(peer, err.to_string()),
        }
    }

    fn protocol_error(&self, peer: &str, reason: String) {
        tracing::warn!(target = "signal", peer = %peer, error = %reason, "malformed direct signaling message");
        self.events.emit(SignalEvent::Error(SignalError::Protocol(reason)));
    }
}

#[async_trait]
impl Signal for SignalMuxer {
    fn state(&self) -> SignalState {
        self.shared.inner.state()
    }

    fn local_peer(&self) -> Option<String> {
        self.shared.inner.local_peer()
    }

    fn subscribe(&self) -> Subscription<SignalEvent> {
        self.shared.events.subscribe()
    }

    async fn open(&self) -> Result<()> {
        self.shared.inner.open().await
    }

    async fn send(&self, payload: Value, to: Option<&str>) -> Result<()> {
        if let Some(peer) = to {
            let known = self
                .shared
                .directory
                .lock()
                .as_ref()
                .map_or(true, |directory| directory.contains(peer));
            if known {
                if let Some(link) = self.shared.direct_link(peer) {
                    let text = serde_json::to_string(&payload)?;
                    match link.send(LinkPayload::Text(text)).await {
                        Ok(()) => {
                            tracing::trace!(target = "signal", peer = %peer, "sent over direct link");
                            return Ok(());
                        }
                        Err(err) => {
                            tracing::debug!(target = "signal", peer = %peer, error = %err, "direct send failed, using relay");
                        }
                    }
                }
            }
        }
        self.shared.inner.send(payload, to).await
    }

    async fn close(&self) -> Result<()> {
        self.shared.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReorderPolicy, RetryPolicy};
    use crate::rtc::mock::MockFactory;
    use crate::signal::mock::MockRelay;
    use crate::signal::OrderedSignal;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        relay: Arc<MockRelay>,
        factory: Arc<MockFactory>,
        muxer: Arc<SignalMuxer>,
        negotiator: Negotiator,
        events: Subscription<SignalEvent>,
    }

    async fn fixture() -> Fixture {
        let relay = MockRelay::new("me");
        let ordered = Arc::new(OrderedSignal::new(
            relay.clone(),
            RetryPolicy::default(),
            ReorderPolicy::default(),
        ));
        let muxer = Arc::new(SignalMuxer::new(ordered));
        let factory = MockFactory::new();
        let negotiator = Negotiator::new(muxer.clone(), factory.clone());
        muxer.attach(&negotiator);
        let mut events = muxer.subscribe();
        muxer.open().await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::Open { peer: "me".into() }
        );
        Fixture {
            relay,
            factory,
            muxer,
            negotiator,
            events,
        }
    }

    async fn next_event(events: &mut Subscription<SignalEvent>) -> SignalEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for signal event")
            .expect("signal event stream ended")
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition never held");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn relays_until_link_opens_then_goes_direct() {
        let f = fixture().await;
        f.relay.deliver_presence("connected", "p1");
        eventually(|| {
            f.factory
                .connection("p1")
                .map(|connection| connection.local_links(SIGNAL_LABEL).len() == 1)
                .unwrap_or(false)
        })
        .await;
        let connection = f.factory.connection("p1").unwrap();
        let link = connection.local_links(SIGNAL_LABEL).remove(0);
        eventually(|| {
            f.relay
                .sent()
                .iter()
                .any(|sent| sent.json()["type"] == "request-for-offer")
        })
        .await;
        f.relay.take_sent();

        f.muxer.send(json!({"type": "ping"}), Some("p1")).await.unwrap();
        assert_eq!(f.relay.take_sent().len(), 1);
        assert!(!f.muxer.has_direct_route("p1"));

        link.set_open();
        assert!(f.muxer.has_direct_route("p1"));
        f.muxer.send(json!({"type": "ping"}), Some("p1")).await.unwrap();
        assert!(f.relay.sent().is_empty());
        assert_eq!(link.sent_text(), vec![r#"{"type":"ping"}"#.to_string()]);

        // broadcasts never use a direct link
        f.muxer.send(json!({"type": "hello"}), None).await.unwrap();
        assert_eq!(f.relay.take_sent().len(), 1);
        assert_eq!(f.negotiator.peers().len(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failed_direct_send_falls_back_to_relay() {
        let f = fixture().await;
        f.relay.deliver_presence("connected", "p1");
        eventually(|| f.muxer.shared.routes.lock().get("p1").map_or(false, |r| r.send.is_some())).await;
        eventually(|| {
            f.relay
                .sent()
                .iter()
                .any(|sent| sent.json()["type"] == "request-for-offer")
        })
        .await;
        f.relay.take_sent();
        let link = f.factory.connection("p1").unwrap().local_links(SIGNAL_LABEL).remove(0);
        link.set_open();

        link.reject_sends("buffer full");
        assert!(f.muxer.has_direct_route("p1"));
        f.muxer.send(json!({"type": "ping", "n": 1}), Some("p1")).await.unwrap();

        assert!(link.sent().is_empty());
        let sent = f.relay.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to.as_deref(), Some("p1"));
        let relayed = sent[0].json();
        assert_eq!(relayed["type"], "ping");
        assert_eq!(relayed["n"], 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn direct_messages_are_emitted_from_the_peer() {
        let mut f = fixture().await;
        f.relay.deliver_presence("connected", "p1");
        // the presence itself is forwarded unchanged
        let presence = next_event(&mut f.events).await;
        assert!(matches!(presence, SignalEvent::Message(ref m) if m.kind() == Some("connected")));

        eventually(|| f.factory.connection("p1").is_some()).await;
        let remote = f.factory.connection("p1").unwrap().open_remote_link(SIGNAL_LABEL);
        // let the route adopt the link before it carries traffic
        eventually(|| remote.sent().is_empty() && f.muxer.shared.routes.lock().get("p1").map_or(false, |r| r.recv.is_some())).await;

        remote.receive_text(r#"{"type":"answer","sdp":"v=0"}"#);
        match next_event(&mut f.events).await {
            SignalEvent::Message(message) => {
                assert_eq!(message.from.as_deref(), Some("p1"));
                assert_eq!(message.seq, None);
                assert_eq!(message.kind(), Some("answer"));
            }
            other => panic!("expected message, got {other:?}"),
        }

        remote.receive_text("{oops");
        assert!(matches!(
            next_event(&mut f.events).await,
            SignalEvent::Error(SignalError::Protocol(_))
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn disconnect_tears_down_the_route() {
        let f = fixture().await;
        f.relay.deliver_presence("connected", "p1");
        eventually(|| f.muxer.shared.routes.lock().get("p1").map_or(false, |r| r.send.is_some())).await;
        let link = f.factory.connection("p1").unwrap().local_links(SIGNAL_LABEL).remove(0);
        link.set_open();

        f.relay.deliver_presence("disconnected", "p1");
        eventually(|| !f.muxer.shared.routes.lock().contains_key("p1")).await;
        assert_eq!(link.state(), LinkState::Closed);
        assert!(!f.muxer.has_direct_route("p1"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn state_reads_through() {
        let mut f = fixture().await;
        assert_eq!(f.muxer.state(), SignalState::Open);
        assert_eq!(f.muxer.local_peer().as_deref(), Some("me"));
        f.muxer.close().await.unwrap();
        assert_eq!(f.muxer.state(), SignalState::Closed);
        assert_eq!(next_event(&mut f.events).await, SignalEvent::Close);
    }
}
