//! Peer discovery over a polling relay, peer-to-peer negotiation, and named data channels
//! spanning every connected peer.
//!
//! The stack is layered: a [`signal::RelayTransport`] delivers opaque envelopes, the
//! [`signal::OrderedSignal`] restores per-sender ordering, the [`signal::SignalMuxer`] moves
//! signaling onto direct links once they exist, the [`negotiation::Negotiator`] drives one
//! [`rtc::PeerConnection`] per remote peer, and [`channel::Channel`]s fan application
//! payloads across all of them. [`session::PeerSession`] wires the layers together.

pub mod channel;
pub mod config;
pub mod error;
pub mod negotiation;
pub mod rtc;
pub mod session;
pub mod signal;
pub mod telemetry;

pub use channel::{Channel, ChannelEvent, ChannelState, Payload};
pub use config::{ReorderPolicy, RetryPolicy, SignalConfig};
pub use error::{Result, SignalError};
pub use negotiation::{Negotiator, PeerEvent};
pub use session::PeerSession;
pub use signal::{Signal, SignalEvent, SignalMessage, SignalState};
