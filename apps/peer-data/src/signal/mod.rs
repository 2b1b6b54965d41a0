pub mod envelope;
pub mod http_polling;
pub mod mock;
pub mod muxer;
pub mod ordering;
pub mod sequence;
pub mod transport;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use signal_bus::Subscription;

use crate::error::{Result, SignalError};

pub use http_polling::HttpPollingTransport;
pub use muxer::SignalMuxer;
pub use ordering::OrderedSignal;
pub use transport::{RelayTransport, TransportEvent, TurnServer};

/// Lifecycle of a signal. Moves forward only; `Opening -> Closed` when opening fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignalState {
    New,
    Opening,
    Open,
    Closing,
    Closed,
}

impl SignalState {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalState::New => "new",
            SignalState::Opening => "opening",
            SignalState::Open => "open",
            SignalState::Closing => "closing",
            SignalState::Closed => "closed",
        }
    }

    pub(crate) fn invalid(self, operation: &'static str) -> SignalError {
        SignalError::State {
            operation,
            state: self.as_str(),
        }
    }
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivered message. Presence envelopes come without `from`; peer payloads carry the
/// sender and, when the relay sequenced them, the ordering key that was stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub payload: Value,
    pub from: Option<String>,
    pub seq: Option<u64>,
}

impl SignalMessage {
    pub fn kind(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Open { peer: String },
    Message(SignalMessage),
    Turn(TurnServer),
    Error(SignalError),
    Close,
}

/// What the negotiation layer needs from a signaling path.
#[async_trait]
pub trait Signal: Send + Sync {
    fn state(&self) -> SignalState;
    /// Our room-assigned id, known once the signal has opened.
    fn local_peer(&self) -> Option<String>;
    fn subscribe(&self) -> Subscription<SignalEvent>;
    async fn open(&self) -> Result<()>;
    /// Send a JSON object to everyone, or only to `to`.
    async fn send(&self, payload: Value, to: Option<&str>) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
