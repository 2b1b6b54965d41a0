//! Point-to-point connection seam. The negotiation layer drives a [`PeerConnection`] per
//! remote peer; channels open named [`DataLink`]s on it.

pub mod mock;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use signal_bus::Subscription;
use thiserror::Error;

use crate::signal::TurnServer;

pub use self::webrtc::{WebRtcFactory, WebRtcOptions};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RtcError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("data link send failed: {0}")]
    Send(String),
    #[error("data link {0:?} is not open")]
    LinkNotOpen(String),
    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPayload {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Open,
    Close,
    Error(String),
    Message(LinkPayload),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkOptions {
    pub ordered: Option<bool>,
    pub max_retransmits: Option<u16>,
    pub protocol: Option<String>,
}

/// One labelled data channel on a peer connection.
#[async_trait]
pub trait DataLink: Send + Sync {
    fn label(&self) -> &str;
    fn state(&self) -> LinkState;
    fn subscribe(&self) -> Subscription<LinkEvent>;
    async fn send(&self, payload: LinkPayload) -> Result<(), RtcError>;
    async fn close(&self) -> Result<(), RtcError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone)]
pub enum ConnectionEvent {
    /// A local candidate to forward; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    NegotiationNeeded,
    StateChange(ConnectionState),
    /// The remote side opened a data link.
    DataLink(Arc<dyn DataLink>),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            ConnectionEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            ConnectionEvent::StateChange(state) => f.debug_tuple("StateChange").field(state).finish(),
            ConnectionEvent::DataLink(link) => f.debug_tuple("DataLink").field(&link.label()).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-compatible candidate shape (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn subscribe(&self) -> Subscription<ConnectionEvent>;
    fn state(&self) -> ConnectionState;
    /// Data links the remote side has opened so far.
    fn remote_links(&self) -> Vec<Arc<dyn DataLink>>;
    async fn create_data_link(
        &self,
        label: &str,
        options: LinkOptions,
    ) -> Result<Arc<dyn DataLink>, RtcError>;
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;
    async fn close(&self) -> Result<(), RtcError>;
}

/// Builds one connection per remote peer, configured with the ICE servers learned so far.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        peer: &str,
        ice_servers: &[TurnServer],
    ) -> Result<Arc<dyn PeerConnection>, RtcError>;
}

/// Find the first remote link carrying `label`.
pub fn find_remote_link(connection: &dyn PeerConnection, label: &str) -> Option<Arc<dyn DataLink>> {
    connection
        .remote_links()
        .into_iter()
        .find(|link| link.label() == label)
}
