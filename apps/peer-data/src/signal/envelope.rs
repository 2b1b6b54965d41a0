//! Relay wire format.
//!
//! Server envelopes are `{type, peer?}` for presence and capacity. Client payloads arrive as
//! `{from, data}` where `data` is a JSON-encoded object carrying `seq` for unicast sends.

use serde_json::{Map, Value};

use crate::error::{Result, SignalError};

pub const SEQ_FIELD: &str = "seq";
pub const RECONNECT: &str = "reconnect";

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `connected` / `disconnected`, forwarded verbatim unless it names ourselves.
    Presence { peer: String, envelope: Value },
    Full(Value),
    Data {
        from: String,
        seq: Option<u64>,
        payload: Map<String, Value>,
    },
}

pub fn classify(raw: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(mut envelope) = value else {
        return Err(SignalError::Protocol("envelope is not an object".into()));
    };
    match envelope.get("type").and_then(Value::as_str) {
        Some("connected") | Some("disconnected") => {
            let peer = envelope
                .get("peer")
                .and_then(Value::as_str)
                .ok_or_else(|| SignalError::Protocol("presence without peer".into()))?
                .to_string();
            Ok(Inbound::Presence {
                peer,
                envelope: Value::Object(envelope),
            })
        }
        Some("full") => Ok(Inbound::Full(Value::Object(envelope))),
        _ => {
            let from = match envelope.remove("from") {
                Some(Value::String(from)) => from,
                _ => return Err(SignalError::Protocol("message without sender".into())),
            };
            let inner = match envelope.remove("data") {
                Some(Value::String(text)) => serde_json::from_str(&text)?,
                Some(value) => value,
                None => return Err(SignalError::Protocol("message without data".into())),
            };
            let Value::Object(mut payload) = inner else {
                return Err(SignalError::Protocol("message data is not an object".into()));
            };
            let seq = match payload.remove(SEQ_FIELD) {
                None => None,
                Some(value) => Some(value.as_u64().ok_or_else(|| {
                    SignalError::Protocol(format!("invalid seq {value}"))
                })?),
            };
            Ok(Inbound::Data { from, seq, payload })
        }
    }
}

/// Serialize an outgoing payload, attaching `seq` when the send is unicast.
pub fn stamp(payload: Value, seq: Option<u64>) -> Result<String> {
    let Value::Object(mut fields) = payload else {
        return Err(SignalError::InvalidMessage(
            "signal payloads must be JSON objects".into(),
        ));
    };
    if let Some(seq) = seq {
        fields.insert(SEQ_FIELD.to_string(), Value::from(seq));
    }
    Ok(serde_json::to_string(&Value::Object(fields))?)
}

pub fn reconnect_request() -> Value {
    serde_json::json!({ "type": RECONNECT })
}
