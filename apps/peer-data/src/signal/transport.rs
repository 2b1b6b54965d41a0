use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use signal_bus::Subscription;

use crate::error::Result;

/// A value the relay sends either bare or wrapped in an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    OneOrMany::deserialize(deserializer).map(OneOrMany::into_vec)
}

/// ICE server parameters advertised by the relay (`{url|urls, username?, credential?}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    #[serde(alias = "url", deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, credential: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The relay accepted us and assigned `peer` as our id.
    Open { peer: String },
    /// One raw envelope, exactly as received.
    Message(String),
    Turn(Vec<TurnServer>),
    Error(String),
    Close,
}

/// The physical relay: delivers opaque JSON envelopes and nothing more.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(&self) -> Result<()>;
    /// Queue `message` for everyone in the room, or only for `to`.
    async fn send(&self, message: String, to: Option<&str>) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn subscribe(&self) -> Subscription<TransportEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turn_accepts_url_or_urls() {
        let single: TurnServer = serde_json::from_value(json!({
            "url": "turn:relay.example.org:3478",
            "username": "u",
            "credential": "p"
        }))
        .unwrap();
        assert_eq!(single.urls, vec!["turn:relay.example.org:3478"]);
        assert_eq!(single.username.as_deref(), Some("u"));

        let many: OneOrMany<TurnServer> = serde_json::from_value(json!([
            {"urls": ["turn:a", "turns:a"]},
            {"urls": "turn:b"}
        ]))
        .unwrap();
        let many = many.into_vec();
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].urls.len(), 2);
        assert_eq!(many[1], TurnServer::new("turn:b"));
    }
}
