use std::time::Duration;

use thiserror::Error;

use crate::rtc::RtcError;

/// Errors produced by the signaling stack. The same values are returned from failed calls
/// and carried by `error` events, so callers can match on the kind either way.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    /// An inbound envelope could not be decoded; only that message is dropped.
    #[error("malformed envelope: {0}")]
    Protocol(String),
    /// The rendezvous point kept reporting the room as full after every reconnect attempt.
    #[error("room is full")]
    Capacity,
    #[error("negotiation with {peer} failed while {step}: {reason}")]
    Negotiation {
        peer: String,
        step: &'static str,
        reason: String,
    },
    #[error("relay transport error: {0}")]
    Transport(String),
    /// An operation was invoked while the object was not in a state that allows it.
    #[error("cannot {operation} while {state}")]
    State {
        operation: &'static str,
        state: &'static str,
    },
    #[error("invalid channel label {0:?}: labels are non-empty ASCII word characters or '-'")]
    InvalidLabel(String),
    #[error("invalid room name {0:?}")]
    InvalidRoom(String),
    #[error("invalid server url {0:?}")]
    InvalidServer(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// A sender's sequence gap was not filled within the configured window.
    #[error("sequence gap from {peer}: seq {expected} missing for {waited:?}")]
    GapTimeout {
        peer: String,
        expected: u64,
        waited: Duration,
    },
    #[error("reorder buffer for {peer} is full ({limit} messages), dropped seq {seq}")]
    ReorderOverflow { peer: String, limit: usize, seq: u64 },
    #[error("signal closed")]
    Closed,
    #[error(transparent)]
    Rtc(#[from] RtcError),
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::Protocol(err.to_string())
    }
}

pub type Result<T, E = SignalError> = std::result::Result<T, E>;
