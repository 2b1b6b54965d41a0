//! Named channels spanning every connected peer.
//!
//! A [`Channel`] opens one data link per peer under its label and reads from the link the
//! remote side opened under the same label. Its aggregate state follows the send links: it is
//! open while any of them is open and closes once every one of them has closed.

mod payload;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use signal_bus::{EventBus, Subscription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use payload::Payload;

use crate::error::{Result, SignalError};
use crate::negotiation::{Negotiator, PeerDirectory, PeerEvent, PeerHandle};
use crate::rtc::{self, ConnectionEvent, DataLink, LinkEvent, LinkOptions, LinkPayload, LinkState};

/// Check a channel label: non-empty ASCII letters, digits, `_` or `-`.
pub fn validate_label(label: &str) -> Result<()> {
    let valid = !label.is_empty()
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(SignalError::InvalidLabel(label.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    New,
    Opening,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::New => "new",
            ChannelState::Opening => "opening",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        }
    }

    fn invalid(self, operation: &'static str) -> SignalError {
        SignalError::State {
            operation,
            state: self.as_str(),
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Close,
    Error(SignalError),
    Message { from: String, payload: Payload },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracked {
    Pending,
    Open,
    Closed,
}

enum Internal {
    Link {
        peer: String,
        generation: u64,
        side: Side,
        event: LinkEvent,
    },
    Adopt {
        peer: String,
        generation: u64,
        link: Arc<dyn DataLink>,
    },
}

struct PeerLinks {
    generation: u64,
    send: Arc<dyn DataLink>,
    recv: Option<Arc<dyn DataLink>>,
    tracked: Tracked,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    state: ChannelState,
    /// Set by an explicit close or the parent closing; the aggregate stops moving.
    terminated: bool,
    links: HashMap<String, PeerLinks>,
    open_count: usize,
    closed_count: usize,
    next_generation: u64,
}

struct Shared {
    label: String,
    options: LinkOptions,
    directory: PeerDirectory,
    events: EventBus<ChannelEvent>,
    inner: Mutex<Inner>,
    internal: mpsc::UnboundedSender<Internal>,
    pending: Mutex<Option<(Subscription<PeerEvent>, mpsc::UnboundedReceiver<Internal>)>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// A labelled channel over every peer of a [`Negotiator`]. Clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// Validates `label` and subscribes to `negotiator`'s peer events. Nothing is created on
    /// any connection until [`Channel::open`].
    pub fn new(label: &str, negotiator: &Negotiator, options: LinkOptions) -> Result<Self> {
        validate_label(label)?;
        let (internal, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            label: label.to_string(),
            options,
            directory: negotiator.peers(),
            events: EventBus::new(),
            inner: Mutex::new(Inner {
                state: ChannelState::New,
                terminated: false,
                links: HashMap::new(),
                open_count: 0,
                closed_count: 0,
                next_generation: 0,
            }),
            internal,
            pending: Mutex::new(Some((negotiator.subscribe(), receiver))),
            pump: Mutex::new(None),
        });
        Ok(Self { shared })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn state(&self) -> ChannelState {
        self.shared.inner.lock().state
    }

    pub fn subscribe(&self) -> Subscription<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Peers this channel has a link to, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.shared.inner.lock().links.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Attach to every current peer and follow peers joining and leaving.
    pub async fn open(&self) -> Result<()> {
        let (parent, internal) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ChannelState::New {
                tracing::warn!(target = "channel", label = %self.shared.label, state = %inner.state, "channel already opened");
                return Err(inner.state.invalid("open"));
            }
            let Some(pending) = self.shared.pending.lock().take() else {
                return Err(inner.state.invalid("open"));
            };
            inner.state = ChannelState::Opening;
            pending
        };
        tracing::debug!(target = "channel", label = %self.shared.label, "opening channel");

        for handle in self.shared.directory.handles() {
            self.shared.attach(handle).await;
        }
        let pump = tokio::spawn(pump(Arc::downgrade(&self.shared), parent, internal));
        *self.shared.pump.lock() = Some(pump);
        Ok(())
    }

    /// Write `payload` to every peer whose link is open. Returns whether any peer got it.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<bool> {
        let links: Vec<(String, Arc<dyn DataLink>)> = {
            let inner = self.shared.inner.lock();
            if inner.terminated || inner.state == ChannelState::New {
                return Err(inner.state.invalid("send"));
            }
            inner
                .links
                .iter()
                .filter(|(_, links)| links.send.state() == LinkState::Open)
                .map(|(peer, links)| (peer.clone(), Arc::clone(&links.send)))
                .collect()
        };
        let text = payload.into().encode(self.shared.directory.local_peer())?;

        let mut delivered = false;
        for (peer, link) in links {
            match link.send(LinkPayload::Text(text.clone())).await {
                Ok(()) => delivered = true,
                Err(err) => {
                    tracing::warn!(target = "channel", label = %self.shared.label, peer = %peer, error = %err, "channel send failed");
                }
            }
        }
        if !delivered {
            tracing::debug!(target = "channel", label = %self.shared.label, "no peer has an open link");
        }
        Ok(delivered)
    }

    /// Close every link and stop following the negotiator.
    pub async fn close(&self) -> Result<()> {
        {
            let inner = self.shared.inner.lock();
            if inner.state == ChannelState::New || inner.terminated {
                return Err(inner.state.invalid("close"));
            }
        }
        if let Some(pump) = self.shared.pump.lock().take() {
            pump.abort();
        }
        self.shared.shutdown().await;
        Ok(())
    }
}

async fn pump(
    shared: Weak<Shared>,
    mut parent: Subscription<PeerEvent>,
    mut internal: mpsc::UnboundedReceiver<Internal>,
) {
    loop {
        tokio::select! {
            event = parent.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                match event {
                    Some(PeerEvent::Connected(handle)) => shared.attach(handle).await,
                    Some(PeerEvent::Disconnected(handle)) => shared.detach(&handle.id).await,
                    Some(PeerEvent::Close) | None => {
                        shared.pump.lock().take();
                        shared.shutdown().await;
                        break;
                    }
                    Some(_) => {}
                }
            }
            Some(message) = internal.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                shared.on_internal(message);
            }
        }
    }
}

async fn watch_link(
    internal: mpsc::UnboundedSender<Internal>,
    peer: String,
    generation: u64,
    side: Side,
    mut events: Subscription<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let closing = event == LinkEvent::Close;
        let message = Internal::Link {
            peer: peer.clone(),
            generation,
            side,
            event,
        };
        if internal.send(message).is_err() || closing {
            break;
        }
    }
}

/// Wait for the remote side's link under `label`, then forward its events.
async fn watch_remote(
    internal: mpsc::UnboundedSender<Internal>,
    peer: String,
    generation: u64,
    label: String,
    mut connection_events: Subscription<ConnectionEvent>,
    existing: Option<Arc<dyn DataLink>>,
) {
    let link = match existing {
        Some(link) => link,
        None => loop {
            match connection_events.recv().await {
                Some(ConnectionEvent::DataLink(link)) if link.label() == label => break link,
                Some(_) => continue,
                None => return,
            }
        },
    };
    drop(connection_events);
    let events = link.subscribe();
    let adopt = Internal::Adopt {
        peer: peer.clone(),
        generation,
        link,
    };
    if internal.send(adopt).is_err() {
        return;
    }
    watch_link(internal, peer, generation, Side::Recv, events).await;
}

impl Shared {
    async fn attach(self: &Arc<Self>, handle: PeerHandle) {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.terminated || inner.links.contains_key(&handle.id) {
                return;
            }
            inner.next_generation += 1;
            inner.next_generation
        };

        // subscribe before looking for an existing link so none can slip between the two
        let connection_events = handle.connection.subscribe();
        let existing = rtc::find_remote_link(handle.connection.as_ref(), &self.label);

        let send = match handle
            .connection
            .create_data_link(&self.label, self.options.clone())
            .await
        {
            Ok(link) => link,
            Err(err) => {
                tracing::warn!(target = "channel", label = %self.label, peer = %handle.id, error = %err, "failed to create data link");
                self.events.emit(ChannelEvent::Error(err.into()));
                return;
            }
        };
        let send_events = send.subscribe();
        let already_open = send.state() == LinkState::Open;

        let tasks = vec![
            tokio::spawn(watch_link(
                self.internal.clone(),
                handle.id.clone(),
                generation,
                Side::Send,
                send_events,
            )),
            tokio::spawn(watch_remote(
                self.internal.clone(),
                handle.id.clone(),
                generation,
                self.label.clone(),
                connection_events,
                existing,
            )),
        ];

        let orphan = {
            let mut inner = self.inner.lock();
            if inner.terminated || inner.links.contains_key(&handle.id) {
                Some((send, tasks))
            } else {
                inner.links.insert(
                    handle.id.clone(),
                    PeerLinks {
                        generation,
                        send,
                        recv: None,
                        tracked: Tracked::Pending,
                        tasks,
                    },
                );
                None
            }
        };
        if let Some((send, tasks)) = orphan {
            for task in tasks {
                task.abort();
            }
            if let Err(err) = send.close().await {
                tracing::debug!(target = "channel", label = %self.label, peer = %handle.id, error = %err, "closing orphaned link");
            }
            return;
        }
        tracing::debug!(target = "channel", label = %self.label, peer = %handle.id, "attached peer");

        if already_open {
            self.transition(&handle.id, generation, Tracked::Open);
        }
    }

    async fn detach(&self, peer: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.links.remove(peer);
            if let Some(links) = &removed {
                match links.tracked {
                    Tracked::Open => inner.open_count -= 1,
                    Tracked::Closed => inner.closed_count -= 1,
                    Tracked::Pending => {}
                }
            }
            removed
        };
        let Some(links) = removed else { return };
        tracing::debug!(target = "channel", label = %self.label, peer = %peer, "detached peer");
        Self::release(peer, links).await;
        self.recompute();
    }

    async fn release(peer: &str, links: PeerLinks) {
        for task in links.tasks {
            task.abort();
        }
        for link in std::iter::once(links.send).chain(links.recv) {
            if matches!(link.state(), LinkState::Closed | LinkState::Closing) {
                continue;
            }
            if let Err(err) = link.close().await {
                tracing::debug!(target = "channel", label = %link.label(), peer = %peer, error = %err, "closing data link");
            }
        }
    }

    fn on_internal(&self, message: Internal) {
        match message {
            Internal::Adopt {
                peer,
                generation,
                link,
            } => {
                let mut inner = self.inner.lock();
                if let Some(links) = inner.links.get_mut(&peer) {
                    if links.generation == generation && links.recv.is_none() {
                        links.recv = Some(link);
                    }
                }
            }
            Internal::Link {
                peer,
                generation,
                side,
                event,
            } => {
                if !self.is_current(&peer, generation) {
                    return;
                }
                match (side, event) {
                    (Side::Send, LinkEvent::Open) => self.transition(&peer, generation, Tracked::Open),
                    (Side::Send, LinkEvent::Close) => {
                        self.transition(&peer, generation, Tracked::Closed)
                    }
                    (_, LinkEvent::Error(reason)) => {
                        tracing::warn!(target = "channel", label = %self.label, peer = %peer, error = %reason, "data link error");
                        self.events.emit(ChannelEvent::Error(SignalError::Transport(format!(
                            "{} link to {peer}: {reason}",
                            self.label
                        ))));
                    }
                    (Side::Recv, LinkEvent::Message(payload)) => self.on_message(&peer, payload),
                    _ => {}
                }
            }
        }
    }

    fn is_current(&self, peer: &str, generation: u64) -> bool {
        self.inner
            .lock()
            .links
            .get(peer)
            .is_some_and(|links| links.generation == generation)
    }

    fn on_message(&self, peer: &str, payload: LinkPayload) {
        let decoded = match payload {
            LinkPayload::Text(text) => Payload::decode(&text),
            LinkPayload::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => Payload::decode(text),
                Err(err) => Err(SignalError::Protocol(err.to_string())),
            },
        };
        match decoded {
            Ok((from, payload)) => {
                self.events.emit(ChannelEvent::Message {
                    from: from.unwrap_or_else(|| peer.to_string()),
                    payload,
                });
            }
            Err(err) => {
                tracing::warn!(target = "channel", label = %self.label, peer = %peer, error = %err, "dropping malformed channel message");
                self.events.emit(ChannelEvent::Error(err));
            }
        }
    }

    fn transition(&self, peer: &str, generation: u64, to: Tracked) {
        {
            let mut inner = self.inner.lock();
            let Some(links) = inner.links.get_mut(peer) else { return };
            if links.generation != generation || links.tracked == to {
                return;
            }
            let from = std::mem::replace(&mut links.tracked, to);
            match from {
                Tracked::Open => inner.open_count -= 1,
                Tracked::Closed => inner.closed_count -= 1,
                Tracked::Pending => {}
            }
            match to {
                Tracked::Open => inner.open_count += 1,
                Tracked::Closed => inner.closed_count += 1,
                Tracked::Pending => {}
            }
        }
        self.recompute();
    }

    fn recompute(&self) {
        let event = {
            let mut inner = self.inner.lock();
            if inner.terminated {
                return;
            }
            if inner.open_count > 0 && inner.state != ChannelState::Open {
                inner.state = ChannelState::Open;
                Some(ChannelEvent::Open)
            } else if inner.open_count == 0
                && inner.closed_count == inner.links.len()
                && inner.state == ChannelState::Open
            {
                inner.state = ChannelState::Closed;
                Some(ChannelEvent::Close)
            } else {
                None
            }
        };
        if let Some(event) = event {
            tracing::info!(target = "channel", label = %self.label, event = ?event, "channel state changed");
            self.events.emit(event);
        }
    }

    async fn shutdown(&self) {
        let (links, was_closed) = {
            let mut inner = self.inner.lock();
            if inner.terminated {
                return;
            }
            inner.terminated = true;
            let was_closed = inner.state == ChannelState::Closed;
            inner.state = ChannelState::Closing;
            inner.open_count = 0;
            inner.closed_count = 0;
            let links: Vec<(String, PeerLinks)> = inner.links.drain().collect();
            (links, was_closed)
        };
        for (peer, links) in links {
            Self::release(&peer, links).await;
        }
        self.inner.lock().state = ChannelState::Closed;
        tracing::info!(target = "channel", label = %self.label, "channel closed");
        if !was_closed {
            self.events.emit(ChannelEvent::Close);
        }
        self.events.close();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        for (_, links) in self.inner.get_mut().links.drain() {
            for task in links.tasks {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReorderPolicy, RetryPolicy};
    use crate::rtc::mock::{MockFactory, MockLink};
    use crate::signal::mock::MockRelay;
    use crate::signal::OrderedSignal;
    use crate::signal::Signal;
    use serde_json::json;
    use std::time::Duration;

    struct Room {
        relay: Arc<MockRelay>,
        factory: Arc<MockFactory>,
        negotiator: Negotiator,
    }

    impl Room {
        async fn with_peers(peers: &[&str]) -> Self {
            let relay = MockRelay::new("me");
            let signal = Arc::new(OrderedSignal::new(
                relay.clone(),
                RetryPolicy::default(),
                ReorderPolicy::default(),
            ));
            let factory = MockFactory::new();
            let negotiator = Negotiator::new(signal.clone(), factory.clone());
            signal.open().await.unwrap();
            for peer in peers {
                relay.deliver_presence("connected", peer);
            }
            let room = Self {
                relay,
                factory,
                negotiator,
            };
            eventually(|| room.negotiator.peers().len() == peers.len()).await;
            room
        }

        fn link(&self, peer: &str, label: &str) -> Arc<MockLink> {
            self.factory
                .connection(peer)
                .expect("no connection")
                .local_links(label)
                .pop()
                .expect("no link")
        }
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

    async fn next_event(events: &mut Subscription<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("channel event stream ended")
    }

    #[test]
    fn label_validation() {
        assert!(validate_label("chat-1").is_ok());
        assert!(validate_label("under_score").is_ok());
        for bad in ["chat one!", "", "   ", "caf\u{e9}", "a:b"] {
            assert_eq!(
                validate_label(bad),
                Err(SignalError::InvalidLabel(bad.to_string())),
                "{bad:?}"
            );
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn invalid_label_creates_nothing() {
        let room = Room::with_peers(&["p1"]).await;
        let err = Channel::new("chat one!", &room.negotiator, LinkOptions::default()).unwrap_err();
        assert!(matches!(err, SignalError::InvalidLabel(_)));
        let connection = room.factory.connection("p1").unwrap();
        assert!(connection.local_links("chat one!").is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn aggregate_state_follows_links() {
        let room = Room::with_peers(&["p1", "p2", "p3"]).await;
        let channel = Channel::new("chat-1", &room.negotiator, LinkOptions::default()).unwrap();
        let mut events = channel.subscribe();
        channel.open().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Opening);
        assert_eq!(channel.peers(), vec!["p1", "p2", "p3"]);

        let links: Vec<_> = ["p1", "p2", "p3"]
            .iter()
            .map(|peer| room.link(peer, "chat-1"))
            .collect();
        for link in &links {
            link.set_open();
        }
        assert_eq!(next_event(&mut events).await, ChannelEvent::Open);
        eventually(|| channel.shared.inner.lock().open_count == 3).await;

        links[0].set_closed();
        links[1].set_closed();
        eventually(|| channel.shared.inner.lock().closed_count == 2).await;
        assert_eq!(channel.state(), ChannelState::Open);

        links[2].set_closed();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Close);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(events.drain().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn late_peers_are_attached() {
        let room = Room::with_peers(&[]).await;
        let channel = Channel::new("chat", &room.negotiator, LinkOptions::default()).unwrap();
        channel.open().await.unwrap();
        room.relay.deliver_presence("connected", "late");
        eventually(|| channel.peers() == vec!["late".to_string()]).await;

        room.relay.deliver_presence("disconnected", "late");
        eventually(|| channel.peers().is_empty()).await;
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn send_reaches_open_links_only() {
        let room = Room::with_peers(&["p1", "p2"]).await;
        let channel = Channel::new("chat", &room.negotiator, LinkOptions::default()).unwrap();
        channel.open().await.unwrap();
        assert!(!channel.send("nobody").await.unwrap());

        let open = room.link("p1", "chat");
        open.set_open();
        assert!(channel.send(json!({"n": 1})).await.unwrap());
        let sent = open.sent_text();
        assert_eq!(sent.len(), 1);
        let envelope: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(envelope, json!({"from": "me", "type": "json", "data": "{\"n\":1}"}));
        assert!(room.link("p2", "chat").sent().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn messages_arrive_on_the_remote_link() {
        let room = Room::with_peers(&["p1"]).await;
        let channel = Channel::new("chat", &room.negotiator, LinkOptions::default()).unwrap();
        let mut events = channel.subscribe();
        channel.open().await.unwrap();

        let remote = room.factory.connection("p1").unwrap().open_remote_link("chat");
        eventually(|| {
            channel
                .shared
                .inner
                .lock()
                .links
                .get("p1")
                .is_some_and(|links| links.recv.is_some())
        })
        .await;
        remote.receive_text(r#"{"from":"p1","type":"string","data":"hello"}"#);
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Message {
                from: "p1".into(),
                payload: Payload::Text("hello".into()),
            }
        );

        remote.receive_text("garbage");
        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::Error(SignalError::Protocol(_))
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn close_is_single_shot() {
        let room = Room::with_peers(&["p1"]).await;
        let channel = Channel::new("chat", &room.negotiator, LinkOptions::default()).unwrap();
        assert!(matches!(channel.close().await, Err(SignalError::State { .. })));

        let mut events = channel.subscribe();
        channel.open().await.unwrap();
        assert!(matches!(channel.open().await, Err(SignalError::State { .. })));
        let link = room.link("p1", "chat");

        channel.close().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(next_event(&mut events).await, ChannelEvent::Close);
        assert!(events.recv().await.is_none());
        assert!(matches!(channel.close().await, Err(SignalError::State { .. })));
        assert!(matches!(channel.send("late").await, Err(SignalError::State { .. })));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn parent_close_tears_down() {
        let room = Room::with_peers(&["p1"]).await;
        let channel = Channel::new("chat", &room.negotiator, LinkOptions::default()).unwrap();
        let mut events = channel.subscribe();
        channel.open().await.unwrap();
        let link = room.link("p1", "chat");
        link.set_open();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Open);

        room.negotiator.close().await.unwrap();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Close);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(link.state(), LinkState::Closed);
    }
}
