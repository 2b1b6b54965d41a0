use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Challenge;
use crate::error::Result;
use crate::rtc::IceCandidate;

/// Everything the negotiation layer reads from or writes to the signal, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NegotiationMessage {
    Connected {
        peer: String,
    },
    Disconnected {
        peer: String,
    },
    Full,
    RequestForOffer {
        challenge: Challenge,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    #[serde(rename = "icecandidate")]
    IceCandidate {
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },
    /// Any other `type`; ignored.
    #[serde(other)]
    Unknown,
}

impl NegotiationMessage {
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_names() {
        let request = NegotiationMessage::RequestForOffer {
            challenge: Challenge::from(5),
        };
        let value = request.to_value().unwrap();
        assert_eq!(value["type"], json!("request-for-offer"));
        assert_eq!(NegotiationMessage::from_value(&value).unwrap(), request);

        let end = NegotiationMessage::IceCandidate { candidate: None };
        assert_eq!(end.to_value().unwrap(), json!({"type": "icecandidate", "candidate": null}));
        assert_eq!(
            NegotiationMessage::from_value(&json!({"type": "icecandidate"})).unwrap(),
            end
        );
    }

    #[test]
    fn presence_ignores_extra_fields() {
        let message = NegotiationMessage::from_value(&json!({
            "type": "connected",
            "peer": "p1",
            "clients": ["p0", "p1"]
        }))
        .unwrap();
        assert_eq!(message, NegotiationMessage::Connected { peer: "p1".into() });
    }

    #[test]
    fn unknown_types_are_tolerated() {
        assert_eq!(
            NegotiationMessage::from_value(&json!({"type": "chat", "text": "hi"})).unwrap(),
            NegotiationMessage::Unknown
        );
        assert!(NegotiationMessage::from_value(&json!({"type": "offer"})).is_err());
    }
}
