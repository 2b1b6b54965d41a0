//! Relay transport speaking the HTTP polling protocol of `peer-road`.
//!
//! Joining is `GET <prefix>/<room>` followed by `POST .../<peer>/connected`. From then on the
//! client posts its queued batch to `.../<peer>` every poll interval and gets its mailbox back.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use signal_bus::{EventBus, Subscription};
use tokio::task::JoinHandle;

use super::transport::{OneOrMany, RelayTransport, TransportEvent, TurnServer};
use crate::config::SignalConfig;
use crate::error::{Result, SignalError};

#[derive(Debug, Deserialize)]
struct JoinResponse {
    #[serde(default)]
    peer: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    turn: Option<OneOrMany<TurnServer>>,
}

#[derive(Debug, PartialEq)]
enum PollOutcome {
    Messages(Vec<String>),
    Disconnected,
    Ignored,
}

fn encode_batch(batch: &[(Option<String>, String)]) -> Result<String> {
    if batch.is_empty() {
        return Ok(String::new());
    }
    Ok(serde_json::to_string(batch)?)
}

fn decode_poll(body: &str) -> Result<PollOutcome> {
    if body.trim().is_empty() {
        return Ok(PollOutcome::Ignored);
    }
    let value: Value = serde_json::from_str(body)?;
    Ok(match value {
        Value::Array(items) => PollOutcome::Messages(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(text) => text,
                    other => other.to_string(),
                })
                .collect(),
        ),
        Value::Object(map) if map.get("state").and_then(Value::as_str) == Some("disconnected") => {
            PollOutcome::Disconnected
        }
        _ => PollOutcome::Ignored,
    })
}

#[derive(Default)]
struct PollState {
    peer: Option<String>,
    token: Option<String>,
    outgoing: Vec<(Option<String>, String)>,
    started: bool,
    closed: bool,
}

struct Shared {
    client: reqwest::Client,
    room_url: String,
    poll_interval: Duration,
    state: Mutex<PollState>,
    events: EventBus<TransportEvent>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

pub struct HttpPollingTransport {
    shared: Arc<Shared>,
}

impl HttpPollingTransport {
    pub fn new(config: &SignalConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()
            .map_err(|err| SignalError::Transport(err.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                room_url: config.room_url()?,
                poll_interval: config.poll_interval,
                state: Mutex::new(PollState::default()),
                events: EventBus::new(),
                poller: Mutex::new(None),
            }),
        })
    }

    /// Peer id assigned by the server, once joined.
    pub fn peer(&self) -> Option<String> {
        self.shared.state.lock().peer.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.shared.state.lock().token.clone()
    }
}

impl Drop for HttpPollingTransport {
    fn drop(&mut self) {
        if let Some(poller) = self.shared.poller.lock().take() {
            poller.abort();
        }
    }
}

impl Shared {
    fn peer_url(&self, peer: &str, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}/{}/{}", self.room_url, peer, suffix),
            None => format!("{}/{}", self.room_url, peer),
        }
    }

    async fn join(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.room_url)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(SignalError::Transport(format!(
                "join rejected with status {}",
                response.status()
            )));
        }
        let joined: JoinResponse = response.json().await.map_err(transport_error)?;
        let Some(peer) = joined.peer.filter(|peer| !peer.is_empty()) else {
            return Err(SignalError::Transport("join response is missing a peer id".into()));
        };
        {
            let mut state = self.state.lock();
            state.peer = Some(peer.clone());
            state.token = joined.token;
        }
        if let Some(turn) = joined.turn {
            self.events.emit(TransportEvent::Turn(turn.into_vec()));
        }

        let response = self
            .client
            .post(self.peer_url(&peer, Some("connected")))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(SignalError::Transport(format!(
                "connect rejected with status {}",
                response.status()
            )));
        }
        Ok(peer)
    }

    /// One round trip. Returns false once the server reports us gone.
    async fn poll_once(&self, peer: &str) -> bool {
        let batch = std::mem::take(&mut self.state.lock().outgoing);
        let body = match encode_batch(&batch) {
            Ok(body) => body,
            Err(err) => {
                self.events.emit(TransportEvent::Error(err.to_string()));
                return true;
            }
        };
        let sent = self
            .client
            .post(self.peer_url(peer, None))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                if err.is_connect() {
                    // nothing reached the server; keep the batch for the next round
                    let mut state = self.state.lock();
                    let newer = std::mem::replace(&mut state.outgoing, batch);
                    state.outgoing.extend(newer);
                }
                tracing::warn!(target = "signal", peer = %peer, error = %err, "poll failed");
                self.events.emit(TransportEvent::Error(err.to_string()));
                return true;
            }
        };
        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!(target = "signal", peer = %peer, status = %status, "poll rejected");
            self.events
                .emit(TransportEvent::Error(format!("poll rejected with status {status}")));
            return true;
        }
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                self.events.emit(TransportEvent::Error(err.to_string()));
                return true;
            }
        };
        match decode_poll(&text) {
            Ok(PollOutcome::Messages(messages)) => {
                for message in messages {
                    self.events.emit(TransportEvent::Message(message));
                }
                true
            }
            Ok(PollOutcome::Disconnected) => {
                tracing::info!(target = "signal", peer = %peer, "server reports us disconnected");
                false
            }
            Ok(PollOutcome::Ignored) => true,
            Err(err) => {
                tracing::warn!(target = "signal", peer = %peer, error = %err, "unreadable poll response");
                self.events.emit(TransportEvent::Error(err.to_string()));
                true
            }
        }
    }

    fn finish(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.outgoing.clear();
        drop(state);
        self.events.emit(TransportEvent::Close);
        self.events.close();
        true
    }
}

async fn poll_loop(shared: Weak<Shared>, peer: String, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(shared) = shared.upgrade() else { break };
        if shared.state.lock().closed {
            break;
        }
        if !shared.poll_once(&peer).await {
            shared.poller.lock().take();
            shared.finish();
            break;
        }
    }
}

fn transport_error(err: reqwest::Error) -> SignalError {
    SignalError::Transport(err.to_string())
}

#[async_trait]
impl RelayTransport for HttpPollingTransport {
    async fn open(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.started || state.closed {
                return Err(SignalError::Transport("transport already opened".into()));
            }
            state.started = true;
        }
        let peer = self.shared.join().await?;
        tracing::info!(target = "signal", peer = %peer, url = %self.shared.room_url, "joined room");
        self.shared
            .events
            .emit(TransportEvent::Open { peer: peer.clone() });
        let poller = tokio::spawn(poll_loop(
            Arc::downgrade(&self.shared),
            peer,
            self.shared.poll_interval,
        ));
        *self.shared.poller.lock() = Some(poller);
        Ok(())
    }

    async fn send(&self, message: String, to: Option<&str>) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(SignalError::Closed);
        }
        state.outgoing.push((to.map(str::to_string), message));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(poller) = self.shared.poller.lock().take() {
            poller.abort();
        }
        let peer = {
            let state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.peer.clone()
        };
        let mut result = Ok(());
        if let Some(peer) = peer {
            let sent = self
                .shared
                .client
                .post(self.shared.peer_url(&peer, Some("disconnected")))
                .send()
                .await;
            if let Err(err) = sent {
                tracing::warn!(target = "signal", peer = %peer, error = %err, "failed to announce disconnect");
                result = Err(transport_error(err));
            }
        }
        self.shared.finish();
        result
    }

    fn subscribe(&self) -> Subscription<TransportEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_batch_is_an_empty_body() {
        assert_eq!(encode_batch(&[]).unwrap(), "");
    }

    #[test]
    fn batch_entries_are_pairs() {
        let batch = vec![
            (None, r#"{"type":"hello"}"#.to_string()),
            (Some("p2".to_string()), r#"{"seq":0}"#.to_string()),
        ];
        let body: Value = serde_json::from_str(&encode_batch(&batch).unwrap()).unwrap();
        assert_eq!(
            body,
            json!([[null, "{\"type\":\"hello\"}"], ["p2", "{\"seq\":0}"]])
        );
    }

    #[test]
    fn poll_responses() {
        assert_eq!(
            decode_poll(r#"["{\"type\":\"connected\",\"peer\":\"b\"}"]"#).unwrap(),
            PollOutcome::Messages(vec![r#"{"type":"connected","peer":"b"}"#.to_string()])
        );
        assert_eq!(
            decode_poll(r#"{"state":"disconnected"}"#).unwrap(),
            PollOutcome::Disconnected
        );
        assert_eq!(decode_poll("").unwrap(), PollOutcome::Ignored);
        assert_eq!(decode_poll(r#"{"num_clients":2}"#).unwrap(), PollOutcome::Ignored);
        assert!(decode_poll("[").is_err());
    }

    #[test]
    fn join_response_accepts_single_turn_entry() {
        let joined: JoinResponse = serde_json::from_value(json!({
            "peer": "abc",
            "turn": {"url": "turn:t:3478", "username": "u", "credential": "c"}
        }))
        .unwrap();
        let turn = joined.turn.unwrap().into_vec();
        assert_eq!(turn[0].urls, vec!["turn:t:3478".to_string()]);
        assert_eq!(joined.peer.as_deref(), Some("abc"));
    }

    #[test]
    fn invalid_room_is_rejected_up_front() {
        let config = SignalConfig {
            room: "no spaces".into(),
            ..Default::default()
        };
        assert!(matches!(
            HttpPollingTransport::new(&config),
            Err(SignalError::InvalidRoom(_))
        ));
    }
}
