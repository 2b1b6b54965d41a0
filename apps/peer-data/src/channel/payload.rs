use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SignalError};

/// Application payload carried on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
    Structured(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PayloadKind {
    String,
    Binary,
    Json,
}

/// `{from, type, data}`; `data` is always a string so the envelope serializes once for every
/// peer.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: Option<String>,
    #[serde(rename = "type")]
    kind: PayloadKind,
    data: String,
}

impl Payload {
    pub(crate) fn encode(&self, from: Option<String>) -> Result<String> {
        let (kind, data) = match self {
            Payload::Text(text) => (PayloadKind::String, text.clone()),
            Payload::Binary(bytes) => (PayloadKind::Binary, STANDARD.encode(bytes)),
            Payload::Structured(value) => (PayloadKind::Json, serde_json::to_string(value)?),
        };
        Ok(serde_json::to_string(&Envelope { from, kind, data })?)
    }

    /// Returns the sender named in the envelope along with the payload.
    pub(crate) fn decode(text: &str) -> Result<(Option<String>, Payload)> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let payload = match envelope.kind {
            PayloadKind::String => Payload::Text(envelope.data),
            PayloadKind::Binary => {
                let bytes = STANDARD
                    .decode(envelope.data.as_bytes())
                    .map_err(|err| SignalError::Protocol(format!("binary payload: {err}")))?;
                Payload::Binary(Bytes::from(bytes))
            }
            PayloadKind::Json => Payload::Structured(serde_json::from_str(&envelope.data)?),
        };
        Ok((envelope.from, payload))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(bytes))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}
