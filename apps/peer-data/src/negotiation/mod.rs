//! Negotiation engine: turns relay presence into peer connections and drives each one
//! through offer, answer and candidate exchange.

mod challenge;
mod directory;
mod message;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use signal_bus::{EventBus, Subscription};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use challenge::{local_offers, Challenge};
pub use directory::{PeerDirectory, PeerHandle};
pub use message::NegotiationMessage;

use crate::error::{Result, SignalError};
use crate::rtc::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceCandidate, RtcError,
    SessionDescription,
};
use crate::signal::{Signal, SignalEvent, SignalMessage, TurnServer};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The signal opened and assigned us `peer`.
    Open { peer: String },
    Connected(PeerHandle),
    Disconnected(PeerHandle),
    StateChange { peer: String, state: ConnectionState },
    Error(SignalError),
    Close,
}

struct PeerNegotiation {
    challenge: Challenge,
    /// When our offer went out, until its answer is applied.
    pending_offer: Option<Instant>,
    watcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    ice_servers: Vec<TurnServer>,
    peers: HashMap<String, PeerNegotiation>,
    closed: bool,
}

/// How long an unanswered offer blocks new requests from the same peer. The answering
/// side reports failures only to itself, so a silent offer must eventually expire.
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

type ChallengeSource = Arc<dyn Fn() -> Challenge + Send + Sync>;

struct Shared {
    signal: Arc<dyn Signal>,
    factory: Arc<dyn ConnectionFactory>,
    directory: PeerDirectory,
    inner: Mutex<Inner>,
    events: EventBus<PeerEvent>,
    challenges: ChallengeSource,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the peer set. Must be created inside a tokio runtime, before the signal opens.
pub struct Negotiator {
    shared: Arc<Shared>,
}

impl Negotiator {
    pub fn new(signal: Arc<dyn Signal>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_challenges(signal, factory, Challenge::random)
    }

    /// Like [`Negotiator::new`] with a custom challenge source.
    pub fn with_challenges<F>(signal: Arc<dyn Signal>, factory: Arc<dyn ConnectionFactory>, challenges: F) -> Self
    where
        F: Fn() -> Challenge + Send + Sync + 'static,
    {
        let inbound = signal.subscribe();
        let shared = Arc::new(Shared {
            signal,
            factory,
            directory: PeerDirectory::default(),
            inner: Mutex::new(Inner::default()),
            events: EventBus::new(),
            challenges: Arc::new(challenges),
            pump: Mutex::new(None),
        });
        let handle = tokio::spawn(pump(Arc::downgrade(&shared), inbound));
        *shared.pump.lock() = Some(handle);
        Self { shared }
    }

    pub fn subscribe(&self) -> Subscription<PeerEvent> {
        self.shared.events.subscribe()
    }

    pub fn peers(&self) -> PeerDirectory {
        self.shared.directory.clone()
    }

    pub fn local_peer(&self) -> Option<String> {
        self.shared.directory.local_peer()
    }

    pub fn signal(&self) -> Arc<dyn Signal> {
        Arc::clone(&self.shared.signal)
    }

    pub fn ice_servers(&self) -> Vec<TurnServer> {
        self.shared.inner.lock().ice_servers.clone()
    }

    pub fn challenge(&self, peer: &str) -> Option<Challenge> {
        self.shared
            .inner
            .lock()
            .peers
            .get(peer)
            .map(|entry| entry.challenge)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Start negotiating with `peer`. Relay presence calls this; it is public for relays
    /// that learn about peers some other way.
    pub async fn add_peer(&self, peer: &str) -> Result<PeerHandle> {
        self.shared.add_peer(peer.to_string()).await
    }

    pub async fn remove_peer(&self, peer: &str) -> Option<PeerHandle> {
        self.shared.remove_peer(peer).await
    }

    /// Close the signal and every peer connection.
    pub async fn close(&self) -> Result<()> {
        let result = self.shared.signal.close().await;
        self.shared.teardown().await;
        result
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        if let Some(pump) = self.shared.pump.lock().take() {
            pump.abort();
        }
        for entry in self.shared.inner.lock().peers.values_mut() {
            if let Some(watcher) = entry.watcher.take() {
                watcher.abort();
            }
        }
    }
}

async fn pump(shared: Weak<Shared>, mut inbound: Subscription<SignalEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        if !shared.on_signal(event).await {
            break;
        }
    }
}

async fn watch_connection(
    shared: Weak<Shared>,
    peer: String,
    mut events: Subscription<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                let message = NegotiationMessage::IceCandidate { candidate };
                if let Err(err) = shared.send_to(&peer, message).await {
                    tracing::warn!(target = "negotiation", peer = %peer, error = %err, "failed to forward ice candidate");
                }
            }
            ConnectionEvent::NegotiationNeeded => {
                let challenge = shared
                    .inner
                    .lock()
                    .peers
                    .get(&peer)
                    .map(|entry| entry.challenge);
                if let Some(challenge) = challenge {
                    tracing::debug!(target = "negotiation", peer = %peer, "negotiation needed");
                    shared.request_offer(&peer, challenge).await;
                }
            }
            ConnectionEvent::StateChange(state) => {
                match state {
                    ConnectionState::Failed | ConnectionState::Disconnected => {
                        tracing::warn!(target = "negotiation", peer = %peer, ?state, "peer connection degraded");
                    }
                    _ => {
                        tracing::debug!(target = "negotiation", peer = %peer, ?state, "peer connection state");
                    }
                }
                shared.events.emit(PeerEvent::StateChange {
                    peer: peer.clone(),
                    state,
                });
            }
            ConnectionEvent::DataLink(_) => {}
        }
    }
}

impl Shared {
    /// Returns false once the signal has closed.
    async fn on_signal(self: &Arc<Self>, event: SignalEvent) -> bool {
        match event {
            SignalEvent::Open { peer } => {
                self.directory.set_local(peer.clone());
                tracing::info!(target = "negotiation", peer = %peer, "joined room");
                self.events.emit(PeerEvent::Open { peer });
            }
            SignalEvent::Turn(server) => {
                let mut inner = self.inner.lock();
                if !inner.ice_servers.contains(&server) {
                    tracing::debug!(target = "negotiation", urls = ?server.urls, "learned ice server");
                    inner.ice_servers.push(server);
                }
            }
            SignalEvent::Error(err) => {
                self.events.emit(PeerEvent::Error(err));
            }
            SignalEvent::Message(message) => self.on_message(message).await,
            SignalEvent::Close => {
                self.teardown().await;
                return false;
            }
        }
        true
    }

    async fn on_message(self: &Arc<Self>, message: SignalMessage) {
        let parsed = match NegotiationMessage::from_value(&message.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(target = "negotiation", from = ?message.from, error = %err, "undecodable negotiation message");
                self.events.emit(PeerEvent::Error(err));
                return;
            }
        };
        match (parsed, message.from) {
            (NegotiationMessage::Connected { peer }, None) => {
                if let Err(err) = self.add_peer(peer).await {
                    tracing::debug!(target = "negotiation", error = %err, "peer not added");
                }
            }
            (NegotiationMessage::Disconnected { peer }, None) => {
                self.remove_peer(&peer).await;
            }
            (NegotiationMessage::Full, None) => {
                tracing::warn!(target = "negotiation", "room is full");
                self.events.emit(PeerEvent::Error(SignalError::Capacity));
            }
            (NegotiationMessage::RequestForOffer { challenge }, Some(from)) => {
                self.on_request_for_offer(&from, challenge).await;
            }
            (NegotiationMessage::Offer { sdp }, Some(from)) => self.on_offer(&from, sdp).await,
            (NegotiationMessage::Answer { sdp }, Some(from)) => self.on_answer(&from, sdp).await,
            (NegotiationMessage::IceCandidate { candidate }, Some(from)) => {
                self.on_candidate(&from, candidate).await;
            }
            (NegotiationMessage::Unknown, _) => {
                tracing::debug!(target = "negotiation", kind = ?message.payload.get("type"), "ignoring non-negotiation message");
            }
            (other, from) => {
                tracing::warn!(target = "negotiation", ?from, message = ?other, "unexpected negotiation message");
            }
        }
    }

    async fn add_peer(self: &Arc<Self>, id: String) -> Result<PeerHandle> {
        if let Some(existing) = self.directory.get(&id) {
            tracing::debug!(target = "negotiation", peer = %id, "peer already known");
            return Ok(existing);
        }
        let ice_servers = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(SignalError::Closed);
            }
            inner.ice_servers.clone()
        };
        let connection = self
            .factory
            .connect(&id, &ice_servers)
            .await
            .map_err(|err| self.failed(&id, "connecting", err))?;
        let connection_events = connection.subscribe();
        let handle = PeerHandle {
            id: id.clone(),
            connection,
        };
        let challenge = (self.challenges)();

        let rejected = {
            let mut inner = self.inner.lock();
            if inner.closed {
                Some(Err(SignalError::Closed))
            } else if let Some(existing) = self.directory.get(&id) {
                Some(Ok(existing))
            } else {
                inner.peers.insert(
                    id.clone(),
                    PeerNegotiation {
                        challenge,
                        pending_offer: None,
                        watcher: None,
                    },
                );
                self.directory.insert(handle.clone());
                None
            }
        };
        if let Some(outcome) = rejected {
            if let Err(err) = handle.connection.close().await {
                tracing::debug!(target = "negotiation", peer = %id, error = %err, "closing duplicate peer connection");
            }
            return outcome;
        }

        tracing::info!(target = "negotiation", peer = %id, "peer connected");
        self.events.emit(PeerEvent::Connected(handle.clone()));

        let watcher = tokio::spawn(watch_connection(Arc::downgrade(self), id.clone(), connection_events));
        match self.inner.lock().peers.get_mut(&id) {
            Some(entry) => entry.watcher = Some(watcher),
            None => watcher.abort(),
        }

        self.request_offer(&id, challenge).await;
        Ok(handle)
    }

    async fn remove_peer(&self, id: &str) -> Option<PeerHandle> {
        let entry = self.inner.lock().peers.remove(id);
        if let Some(watcher) = entry.and_then(|entry| entry.watcher) {
            watcher.abort();
        }
        let Some(handle) = self.directory.remove(id) else {
            tracing::debug!(target = "negotiation", peer = %id, "disconnect for unknown peer");
            return None;
        };
        if let Err(err) = handle.connection.close().await {
            tracing::warn!(target = "negotiation", peer = %id, error = %err, "failed to close peer connection");
        }
        tracing::info!(target = "negotiation", peer = %id, "peer disconnected");
        self.events.emit(PeerEvent::Disconnected(handle.clone()));
        Some(handle)
    }

    async fn teardown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        for handle in self.directory.drain() {
            let entry = self.inner.lock().peers.remove(&handle.id);
            if let Some(watcher) = entry.and_then(|entry| entry.watcher) {
                watcher.abort();
            }
            if let Err(err) = handle.connection.close().await {
                tracing::warn!(target = "negotiation", peer = %handle.id, error = %err, "failed to close peer connection");
            }
            self.events.emit(PeerEvent::Disconnected(handle));
        }
        tracing::info!(target = "negotiation", "negotiator closed");
        self.events.emit(PeerEvent::Close);
        self.events.close();
    }

    async fn send_to(&self, peer: &str, message: NegotiationMessage) -> Result<()> {
        let payload = message.to_value()?;
        self.signal.send(payload, Some(peer)).await
    }

    async fn request_offer(&self, peer: &str, challenge: Challenge) {
        if let Err(err) = self
            .send_to(peer, NegotiationMessage::RequestForOffer { challenge })
            .await
        {
            tracing::warn!(target = "negotiation", peer = %peer, error = %err, "failed to request offer");
        }
    }

    async fn on_request_for_offer(&self, from: &str, remote: Challenge) {
        let local_id = self.directory.local_peer().unwrap_or_default();
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.peers.get_mut(from) else {
                tracing::warn!(target = "negotiation", peer = %from, "request-for-offer from unknown peer");
                return;
            };
            if let Some(sent_at) = entry.pending_offer {
                if sent_at.elapsed() < ANSWER_TIMEOUT {
                    tracing::debug!(target = "negotiation", peer = %from, "offer already in flight, ignoring request");
                    return;
                }
                tracing::debug!(target = "negotiation", peer = %from, "previous offer went unanswered, offering again");
            }
            if !local_offers(&entry.challenge, &local_id, &remote, from) {
                tracing::debug!(target = "negotiation", peer = %from, "remote side offers");
                return;
            }
            entry.pending_offer = Some(Instant::now());
        }
        let Some(handle) = self.directory.get(from) else { return };

        let offered: std::result::Result<SessionDescription, RtcError> = async {
            let offer = handle.connection.create_offer().await?;
            handle.connection.set_local_description(offer.clone()).await?;
            Ok(offer)
        }
        .await;
        match offered {
            Ok(offer) => {
                tracing::debug!(target = "negotiation", peer = %from, "sending offer");
                if let Err(err) = self.send_to(from, NegotiationMessage::Offer { sdp: offer.sdp }).await {
                    tracing::warn!(target = "negotiation", peer = %from, error = %err, "failed to send offer");
                    self.clear_pending(from);
                }
            }
            Err(err) => {
                self.failed(from, "creating offer", err);
                self.clear_pending(from);
            }
        }
    }

    async fn on_offer(&self, from: &str, sdp: String) {
        let Some(handle) = self.directory.get(from) else {
            tracing::warn!(target = "negotiation", peer = %from, "offer from unknown peer");
            return;
        };
        let answered: std::result::Result<SessionDescription, RtcError> = async {
            handle
                .connection
                .set_remote_description(SessionDescription::offer(sdp))
                .await?;
            let answer = handle.connection.create_answer().await?;
            handle.connection.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;
        match answered {
            Ok(answer) => {
                tracing::debug!(target = "negotiation", peer = %from, "sending answer");
                if let Err(err) = self.send_to(from, NegotiationMessage::Answer { sdp: answer.sdp }).await {
                    tracing::warn!(target = "negotiation", peer = %from, error = %err, "failed to send answer");
                }
            }
            Err(err) => {
                self.failed(from, "answering offer", err);
            }
        }
    }

    async fn on_answer(&self, from: &str, sdp: String) {
        let Some(handle) = self.directory.get(from) else {
            tracing::warn!(target = "negotiation", peer = %from, "answer from unknown peer");
            return;
        };
        if let Err(err) = handle
            .connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            self.failed(from, "applying answer", err);
        }
        self.clear_pending(from);
    }

    async fn on_candidate(&self, from: &str, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            tracing::debug!(target = "negotiation", peer = %from, "end of remote candidates");
            return;
        };
        let Some(handle) = self.directory.get(from) else {
            tracing::warn!(target = "negotiation", peer = %from, "candidate from unknown peer");
            return;
        };
        if let Err(err) = handle.connection.add_ice_candidate(candidate).await {
            self.failed(from, "adding candidate", err);
        }
    }

    fn clear_pending(&self, peer: &str) {
        if let Some(entry) = self.inner.lock().peers.get_mut(peer) {
            entry.pending_offer = None;
        }
    }

    /// Log and report a failed step. The peer stays registered.
    fn failed(&self, peer: &str, step: &'static str, reason: impl Display) -> SignalError {
        tracing::warn!(target = "negotiation", peer = %peer, step, error = %reason, "negotiation step failed");
        let err = SignalError::Negotiation {
            peer: peer.to_string(),
            step,
            reason: reason.to_string(),
        };
        self.events.emit(PeerEvent::Error(err.clone()));
        err
    }
}
