//! [`ConnectionFactory`] over the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_bus::{EventBus, Subscription};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ConnectionEvent, ConnectionFactory, ConnectionState, DataLink, IceCandidate, LinkEvent,
    LinkOptions, LinkPayload, LinkState, PeerConnection, RtcError, SdpKind, SessionDescription,
};
use crate::signal::TurnServer;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct WebRtcOptions {
    pub stun_servers: Vec<String>,
    /// Only host candidates plus whatever TURN the relay hands out.
    pub disable_stun: bool,
}

impl Default for WebRtcOptions {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            disable_stun: false,
        }
    }
}

impl WebRtcOptions {
    fn ice_servers(&self, turn: &[TurnServer]) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();
        if !self.disable_stun && !self.stun_servers.is_empty() {
            servers.push(RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            });
        }
        servers.extend(turn.iter().map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }));
        servers
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebRtcFactory {
    options: WebRtcOptions,
}

impl WebRtcFactory {
    pub fn new(options: WebRtcOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn connect(
        &self,
        peer: &str,
        ice_servers: &[TurnServer],
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: self.options.ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|err| RtcError::Setup(err.to_string()))?;
        tracing::debug!(target = "negotiation", peer = %peer, "created webrtc peer connection");
        Ok(Arc::new(WebRtcConnection::wrap(peer, Arc::new(pc))))
    }
}

pub struct WebRtcConnection {
    peer: String,
    pc: Arc<RTCPeerConnection>,
    events: EventBus<ConnectionEvent>,
    remote_links: Arc<Mutex<Vec<Arc<dyn DataLink>>>>,
}

impl WebRtcConnection {
    fn wrap(peer: &str, pc: Arc<RTCPeerConnection>) -> Self {
        let events = EventBus::new();
        let remote_links: Arc<Mutex<Vec<Arc<dyn DataLink>>>> = Arc::new(Mutex::new(Vec::new()));

        let bus = events.clone();
        let candidate_peer = peer.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let event = match candidate {
                None => Some(ConnectionEvent::IceCandidate(None)),
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(ConnectionEvent::IceCandidate(Some(from_candidate_init(init)))),
                    Err(err) => {
                        tracing::warn!(target = "negotiation", peer = %candidate_peer, error = %err, "could not serialize local candidate");
                        None
                    }
                },
            };
            if let Some(event) = event {
                bus.emit(event);
            }
            Box::pin(async {})
        }));

        let bus = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            bus.emit(ConnectionEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let bus = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            bus.emit(ConnectionEvent::StateChange(connection_state(state)));
            Box::pin(async {})
        }));

        let bus = events.clone();
        let links = Arc::clone(&remote_links);
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let link: Arc<dyn DataLink> = Arc::new(WebRtcLink::wrap(channel));
            links.lock().push(Arc::clone(&link));
            bus.emit(ConnectionEvent::DataLink(link));
            Box::pin(async {})
        }));

        Self {
            peer: peer.to_string(),
            pc,
            events,
            remote_links,
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    fn remote_links(&self) -> Vec<Arc<dyn DataLink>> {
        self.remote_links.lock().clone()
    }

    async fn create_data_link(
        &self,
        label: &str,
        options: LinkOptions,
    ) -> Result<Arc<dyn DataLink>, RtcError> {
        let init = RTCDataChannelInit {
            ordered: options.ordered,
            max_retransmits: options.max_retransmits,
            protocol: options.protocol,
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| RtcError::Setup(err.to_string()))?;
        tracing::debug!(target = "negotiation", peer = %self.peer, label = %label, "created data channel");
        Ok(Arc::new(WebRtcLink::wrap(channel)))
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| RtcError::Description(err.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| RtcError::Description(err.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|err| RtcError::Description(err.to_string()))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|err| RtcError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| RtcError::Candidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc
            .close()
            .await
            .map_err(|err| RtcError::Setup(err.to_string()))
    }
}

struct WebRtcLink {
    label: String,
    channel: Arc<RTCDataChannel>,
    events: EventBus<LinkEvent>,
}

impl WebRtcLink {
    fn wrap(channel: Arc<RTCDataChannel>) -> Self {
        let events = EventBus::new();

        let bus = events.clone();
        channel.on_open(Box::new(move || {
            bus.emit(LinkEvent::Open);
            Box::pin(async {})
        }));

        let bus = events.clone();
        channel.on_close(Box::new(move || {
            bus.emit(LinkEvent::Close);
            Box::pin(async {})
        }));

        let bus = events.clone();
        channel.on_error(Box::new(move |err: webrtc::Error| {
            bus.emit(LinkEvent::Error(err.to_string()));
            Box::pin(async {})
        }));

        let bus = events.clone();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let payload = if message.is_string {
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => LinkPayload::Text(text),
                    Err(_) => LinkPayload::Binary(message.data),
                }
            } else {
                LinkPayload::Binary(message.data)
            };
            bus.emit(LinkEvent::Message(payload));
            Box::pin(async {})
        }));

        Self {
            label: channel.label().to_string(),
            channel,
            events,
        }
    }
}

#[async_trait]
impl DataLink for WebRtcLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> LinkState {
        match self.channel.ready_state() {
            RTCDataChannelState::Open => LinkState::Open,
            RTCDataChannelState::Closing => LinkState::Closing,
            RTCDataChannelState::Closed => LinkState::Closed,
            _ => LinkState::Connecting,
        }
    }

    fn subscribe(&self) -> Subscription<LinkEvent> {
        self.events.subscribe()
    }

    async fn send(&self, payload: LinkPayload) -> Result<(), RtcError> {
        if self.state() != LinkState::Open {
            return Err(RtcError::LinkNotOpen(self.label.clone()));
        }
        let sent = match payload {
            LinkPayload::Text(text) => self.channel.send_text(text).await,
            LinkPayload::Binary(bytes) => self.channel.send(&bytes).await,
        };
        sent.map(|_| ()).map_err(|err| RtcError::Send(err.to_string()))
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.channel
            .close()
            .await
            .map_err(|err| RtcError::Send(err.to_string()))
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return Err(RtcError::Description("rollback is not supported".into()));
        }
    };
    converted.map_err(|err| RtcError::Description(err.to_string()))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, RtcError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(RtcError::Description(format!("unexpected sdp type {other}")));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_then_turn() {
        let turn = vec![TurnServer::new("turn:relay.example:3478").with_credentials("u", "p")];
        let servers = WebRtcOptions::default().ice_servers(&turn);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(servers[1].urls, vec!["turn:relay.example:3478".to_string()]);
        assert_eq!(servers[1].username, "u");
        assert_eq!(servers[1].credential, "p");
    }

    #[test]
    fn disabling_stun_keeps_turn() {
        let options = WebRtcOptions {
            disable_stun: true,
            ..Default::default()
        };
        assert!(options.ice_servers(&[]).is_empty());
        let servers = options.ice_servers(&[TurnServer::new("turn:t")]);
        assert_eq!(servers.len(), 1);
        assert!(servers[0].username.is_empty());
    }

    #[test]
    fn rollback_is_refused() {
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(to_rtc_description(rollback), Err(RtcError::Description(_))));
    }

    #[test]
    fn candidate_fields_carry_over() {
        let candidate = from_candidate_init(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }

    #[tokio::test]
    async fn offer_round_trips_through_conversion() {
        let factory = WebRtcFactory::new(WebRtcOptions {
            disable_stun: true,
            ..Default::default()
        });
        let connection = factory.connect("remote", &[]).await.unwrap();
        let link = connection
            .create_data_link("chat", LinkOptions::default())
            .await
            .unwrap();
        assert_eq!(link.label(), "chat");
        assert_eq!(link.state(), LinkState::Connecting);

        let offer = connection.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        connection.set_local_description(offer).await.unwrap();
        assert!(matches!(
            link.send(LinkPayload::Text("early".into())).await,
            Err(RtcError::LinkNotOpen(_))
        ));
        connection.close().await.unwrap();
    }
}
