use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_bus::{EventBus, Subscription};

use super::{
    ConnectionEvent, ConnectionFactory, ConnectionState, DataLink, IceCandidate, LinkEvent,
    LinkOptions, LinkPayload, LinkState, PeerConnection, RtcError, SdpKind, SessionDescription,
};
use crate::signal::TurnServer;

/// Data link whose readiness is driven by the test.
pub struct MockLink {
    label: String,
    state: Mutex<LinkState>,
    events: EventBus<LinkEvent>,
    sent: Mutex<Vec<LinkPayload>>,
    send_failure: Mutex<Option<String>>,
}

impl MockLink {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            state: Mutex::new(LinkState::Connecting),
            events: EventBus::new(),
            sent: Mutex::new(Vec::new()),
            send_failure: Mutex::new(None),
        })
    }

    pub fn set_open(&self) {
        *self.state.lock() = LinkState::Open;
        self.events.emit(LinkEvent::Open);
    }

    pub fn set_closed(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), LinkState::Closed);
        if previous != LinkState::Closed {
            self.events.emit(LinkEvent::Close);
        }
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.events.emit(LinkEvent::Error(reason.into()));
    }

    /// Make every later `send` fail with `reason` while the link still reports open.
    pub fn reject_sends(&self, reason: impl Into<String>) {
        *self.send_failure.lock() = Some(reason.into());
    }

    /// Simulate a payload arriving from the remote side.
    pub fn receive(&self, payload: LinkPayload) {
        self.events.emit(LinkEvent::Message(payload));
    }

    pub fn receive_text(&self, text: impl Into<String>) {
        self.receive(LinkPayload::Text(text.into()));
    }

    pub fn sent(&self) -> Vec<LinkPayload> {
        self.sent.lock().clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|payload| match payload {
                LinkPayload::Text(text) => Some(text.clone()),
                LinkPayload::Binary(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl DataLink for MockLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    fn subscribe(&self) -> Subscription<LinkEvent> {
        self.events.subscribe()
    }

    async fn send(&self, payload: LinkPayload) -> Result<(), RtcError> {
        if self.state() != LinkState::Open {
            return Err(RtcError::LinkNotOpen(self.label.clone()));
        }
        if let Some(reason) = self.send_failure.lock().clone() {
            return Err(RtcError::Send(reason));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.set_closed();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

/// Records every negotiation step and hands out [`MockLink`]s.
pub struct MockConnection {
    peer: String,
    events: EventBus<ConnectionEvent>,
    state: Mutex<ConnectionState>,
    calls: Mutex<Vec<Call>>,
    local_links: Mutex<Vec<Arc<MockLink>>>,
    remote_links: Mutex<Vec<Arc<MockLink>>>,
    reject_remote: Mutex<Option<String>>,
}

impl MockConnection {
    pub fn new(peer: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.into(),
            events: EventBus::new(),
            state: Mutex::new(ConnectionState::New),
            calls: Mutex::new(Vec::new()),
            local_links: Mutex::new(Vec::new()),
            remote_links: Mutex::new(Vec::new()),
            reject_remote: Mutex::new(None),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        self.events.emit(event);
    }

    /// Make the next `set_remote_description` fail with `reason`.
    pub fn reject_remote_description(&self, reason: impl Into<String>) {
        *self.reject_remote.lock() = Some(reason.into());
    }

    /// Links created locally, in creation order.
    pub fn local_links(&self, label: &str) -> Vec<Arc<MockLink>> {
        self.local_links
            .lock()
            .iter()
            .filter(|link| link.label == label)
            .cloned()
            .collect()
    }

    /// Simulate the remote side opening a link with `label`.
    pub fn open_remote_link(&self, label: &str) -> Arc<MockLink> {
        let link = MockLink::new(label);
        link.set_open();
        self.remote_links.lock().push(link.clone());
        self.events.emit(ConnectionEvent::DataLink(link.clone()));
        link
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn remote_links(&self) -> Vec<Arc<dyn DataLink>> {
        self.remote_links
            .lock()
            .iter()
            .map(|link| link.clone() as Arc<dyn DataLink>)
            .collect()
    }

    async fn create_data_link(
        &self,
        label: &str,
        _options: LinkOptions,
    ) -> Result<Arc<dyn DataLink>, RtcError> {
        if self.state() == ConnectionState::Closed {
            return Err(RtcError::Closed);
        }
        let link = MockLink::new(label);
        self.local_links.lock().push(link.clone());
        Ok(link)
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.record(Call::CreateOffer);
        Ok(SessionDescription::offer(format!("offer-for-{}", self.peer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer-for-{}", self.peer)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.record(Call::SetLocal(description.kind));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        if let Some(reason) = self.reject_remote.lock().take() {
            return Err(RtcError::Description(reason));
        }
        self.record(Call::SetRemote(description.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.record(Call::Close);
        *self.state.lock() = ConnectionState::Closed;
        Ok(())
    }
}

/// Hands out a fresh [`MockConnection`] per peer and remembers it.
#[derive(Default)]
pub struct MockFactory {
    connections: Mutex<HashMap<String, Arc<MockConnection>>>,
    ice_servers: Mutex<Vec<Vec<TurnServer>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection(&self, peer: &str) -> Option<Arc<MockConnection>> {
        self.connections.lock().get(peer).cloned()
    }

    /// ICE configuration passed to each `connect`, in call order.
    pub fn ice_servers(&self) -> Vec<Vec<TurnServer>> {
        self.ice_servers.lock().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(
        &self,
        peer: &str,
        ice_servers: &[TurnServer],
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let connection = MockConnection::new(peer);
        self.connections
            .lock()
            .insert(peer.to_string(), connection.clone());
        self.ice_servers.lock().push(ice_servers.to_vec());
        Ok(connection)
    }
}
