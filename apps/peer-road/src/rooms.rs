//! In-memory rooms and per-client mailboxes.
//!
//! A client is a member of its room or waiting: it asked to connect while the room was full.
//! Waiting clients keep a mailbox (that is where `full` goes) and join when they send a
//! `reconnect`. Everything a client is sent sits in its mailbox until its next poll.
//! Presence notices carry the member list as seen by their recipient.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::time::Instant;

#[derive(Debug)]
struct Client {
    member: bool,
    mailbox: Vec<String>,
    touched: Instant,
}

impl Client {
    fn new(member: bool, now: Instant) -> Self {
        Self {
            member,
            mailbox: Vec::new(),
            touched: now,
        }
    }
}

#[derive(Debug, Default)]
struct Room {
    clients: HashMap<String, Client>,
    /// Members in join order, so presence goes out in a stable order.
    members: Vec<String>,
}

impl Room {
    fn deliver(&mut self, to: &str, message: &Value) -> bool {
        match self.clients.get_mut(to) {
            Some(client) => {
                client.mailbox.push(message.to_string());
                true
            }
            None => false,
        }
    }

    fn admit(&mut self, peer: &str, max_clients: usize, now: Instant) -> JoinOutcome {
        if self.clients.get(peer).is_some_and(|client| client.member) {
            return JoinOutcome::Joined {
                num_clients: self.members.len(),
            };
        }
        if self.members.len() >= max_clients {
            let client = self
                .clients
                .entry(peer.to_string())
                .or_insert_with(|| Client::new(false, now));
            client.touched = now;
            client.mailbox.push(json!({"type": "full"}).to_string());
            return JoinOutcome::Full {
                num_clients: self.members.len(),
            };
        }

        let existing = self.members.clone();
        let client = self
            .clients
            .entry(peer.to_string())
            .or_insert_with(|| Client::new(true, now));
        client.member = true;
        client.touched = now;
        for member in &existing {
            client.mailbox.push(
                json!({"type": "connected", "peer": member, "clients": existing}).to_string(),
            );
        }
        self.members.push(peer.to_string());
        let announcement = json!({"type": "connected", "peer": peer, "clients": self.members});
        for member in &existing {
            self.deliver(member, &announcement);
        }
        JoinOutcome::Joined {
            num_clients: self.members.len(),
        }
    }

    fn remove(&mut self, peer: &str) -> bool {
        let Some(client) = self.clients.remove(peer) else {
            return false;
        };
        if !client.member {
            return false;
        }
        self.members.retain(|member| member != peer);
        let announcement = json!({"type": "disconnected", "peer": peer, "clients": self.members});
        for member in self.members.clone() {
            self.deliver(&member, &announcement);
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { num_clients: usize },
    Full { num_clients: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReply {
    Messages(Vec<String>),
    /// The client is not known to the room (never connected, left, or reaped).
    Disconnected,
}

/// One queued outgoing message: recipient (`None` for everyone else) and the message text.
pub type BatchEntry = (Option<String>, String);

pub struct RoomStore {
    rooms: DashMap<String, Room>,
    max_clients: usize,
}

impl RoomStore {
    pub fn new(max_clients: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            max_clients,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms
            .get(room)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    pub fn connect(&self, room: &str, peer: &str) -> JoinOutcome {
        let outcome = self
            .rooms
            .entry(room.to_string())
            .or_default()
            .admit(peer, self.max_clients, Instant::now());
        match outcome {
            JoinOutcome::Joined { num_clients } => {
                tracing::info!(target = "road", room = %room, peer = %peer, num_clients, "client joined");
            }
            JoinOutcome::Full { num_clients } => {
                tracing::info!(target = "road", room = %room, peer = %peer, num_clients, "room full");
            }
        }
        outcome
    }

    /// Remove `peer`; remaining members hear `disconnected` if it was one of them.
    pub fn disconnect(&self, room: &str, peer: &str) -> usize {
        let remaining = {
            let Some(mut entry) = self.rooms.get_mut(room) else {
                return 0;
            };
            if entry.remove(peer) {
                tracing::info!(target = "road", room = %room, peer = %peer, "client left");
            }
            entry.clients.len()
        };
        if remaining == 0 {
            self.rooms.remove_if(room, |_, current| current.clients.is_empty());
        }
        self.member_count(room)
    }

    /// Route `batch` from `peer`, then hand back its mailbox.
    pub fn poll(&self, room: &str, peer: &str, batch: Vec<BatchEntry>) -> PollReply {
        let Some(mut entry) = self.rooms.get_mut(room) else {
            return PollReply::Disconnected;
        };
        let now = Instant::now();
        let mut member = match entry.clients.get_mut(peer) {
            Some(client) => {
                client.touched = now;
                client.member
            }
            None => return PollReply::Disconnected,
        };

        for (to, message) in batch {
            if is_reconnect(&message) {
                if !member {
                    tracing::debug!(target = "road", room = %room, peer = %peer, "reconnect attempt");
                    member = matches!(
                        entry.admit(peer, self.max_clients, now),
                        JoinOutcome::Joined { .. }
                    );
                }
                continue;
            }
            if !member {
                tracing::debug!(target = "road", room = %room, peer = %peer, "dropping message from waiting client");
                continue;
            }
            let envelope = json!({"from": peer, "data": message});
            match to.filter(|to| !to.is_empty()) {
                Some(to) => {
                    let is_member = entry.clients.get(&to).is_some_and(|client| client.member);
                    if !is_member || !entry.deliver(&to, &envelope) {
                        tracing::warn!(target = "road", room = %room, from = %peer, to = %to, "recipient is not in the room");
                    }
                }
                None => {
                    for other in entry.members.clone() {
                        if other != peer {
                            entry.deliver(&other, &envelope);
                        }
                    }
                }
            }
        }

        match entry.clients.get_mut(peer) {
            Some(client) => PollReply::Messages(std::mem::take(&mut client.mailbox)),
            None => PollReply::Disconnected,
        }
    }

    /// Drop clients idle for longer than `ttl`. Returns the `(room, peer)` pairs removed.
    pub fn reap(&self, ttl: Duration) -> Vec<(String, String)> {
        let now = Instant::now();
        let stale: Vec<(String, String)> = self
            .rooms
            .iter()
            .flat_map(|room| {
                let name = room.key().clone();
                room.clients
                    .iter()
                    .filter(|(_, client)| now.duration_since(client.touched) > ttl)
                    .map(|(peer, _)| (name.clone(), peer.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (room, peer) in &stale {
            tracing::info!(target = "road", room = %room, peer = %peer, "reaping idle client");
            self.disconnect(room, peer);
        }
        stale
    }
}

fn is_reconnect(message: &str) -> bool {
    serde_json::from_str::<Value>(message)
        .ok()
        .and_then(|value| value.get("type").and_then(Value::as_str).map(str::to_string))
        .is_some_and(|kind| kind == "reconnect")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(store: &RoomStore, room: &str, peer: &str) -> Vec<Value> {
        match store.poll(room, peer, Vec::new()) {
            PollReply::Messages(messages) => messages
                .iter()
                .map(|message| serde_json::from_str(message).unwrap())
                .collect(),
            PollReply::Disconnected => panic!("{peer} is not in {room}"),
        }
    }

    #[test]
    fn presence_flows_both_ways() {
        let store = RoomStore::new(8);
        assert_eq!(store.connect("r", "a"), JoinOutcome::Joined { num_clients: 1 });
        assert_eq!(store.connect("r", "b"), JoinOutcome::Joined { num_clients: 2 });
        assert_eq!(
            drain(&store, "r", "a"),
            vec![json!({"type": "connected", "peer": "b", "clients": ["a", "b"]})]
        );
        assert_eq!(
            drain(&store, "r", "b"),
            vec![json!({"type": "connected", "peer": "a", "clients": ["a"]})]
        );

        assert_eq!(store.disconnect("r", "a"), 1);
        assert_eq!(
            drain(&store, "r", "b"),
            vec![json!({"type": "disconnected", "peer": "a", "clients": ["b"]})]
        );
        assert_eq!(store.poll("r", "a", Vec::new()), PollReply::Disconnected);
    }

    #[test]
    fn presence_lists_members_in_join_order() {
        let store = RoomStore::new(8);
        for peer in ["a", "b", "c"] {
            store.connect("r", peer);
        }
        assert_eq!(
            drain(&store, "r", "c"),
            vec![
                json!({"type": "connected", "peer": "a", "clients": ["a", "b"]}),
                json!({"type": "connected", "peer": "b", "clients": ["a", "b"]}),
            ]
        );
        assert_eq!(
            drain(&store, "r", "a"),
            vec![
                json!({"type": "connected", "peer": "b", "clients": ["a", "b"]}),
                json!({"type": "connected", "peer": "c", "clients": ["a", "b", "c"]}),
            ]
        );

        store.disconnect("r", "b");
        assert_eq!(
            drain(&store, "r", "c"),
            vec![json!({"type": "disconnected", "peer": "b", "clients": ["a", "c"]})]
        );
    }

    #[test]
    fn connecting_twice_is_harmless() {
        let store = RoomStore::new(8);
        store.connect("r", "a");
        store.connect("r", "b");
        assert_eq!(store.connect("r", "b"), JoinOutcome::Joined { num_clients: 2 });
        assert_eq!(drain(&store, "r", "a").len(), 1);
    }

    #[test]
    fn full_room_then_reconnect() {
        let store = RoomStore::new(1);
        store.connect("r", "a");
        assert_eq!(store.connect("r", "b"), JoinOutcome::Full { num_clients: 1 });
        assert_eq!(drain(&store, "r", "b"), vec![json!({"type": "full"})]);
        assert!(drain(&store, "r", "a").is_empty());

        // waiting clients cannot talk to members
        store.poll("r", "b", vec![(None, r#"{"type":"hi"}"#.into())]);
        assert!(drain(&store, "r", "a").is_empty());

        store.disconnect("r", "a");
        let reconnect = vec![(None, r#"{"type":"reconnect"}"#.to_string())];
        assert_eq!(store.poll("r", "b", reconnect), PollReply::Messages(vec![]));
        assert_eq!(store.member_count("r"), 1);
    }

    #[test]
    fn reconnect_while_still_full_queues_another_full() {
        let store = RoomStore::new(1);
        store.connect("r", "a");
        store.connect("r", "b");
        drain(&store, "r", "b");
        let reconnect = vec![(None, r#"{"type":"reconnect"}"#.to_string())];
        let reply = store.poll("r", "b", reconnect);
        assert_eq!(reply, PollReply::Messages(vec![r#"{"type":"full"}"#.to_string()]));
    }

    #[test]
    fn unicast_and_broadcast() {
        let store = RoomStore::new(8);
        for peer in ["a", "b", "c"] {
            store.connect("r", peer);
        }
        for peer in ["a", "b", "c"] {
            drain(&store, "r", peer);
        }

        let batch = vec![
            (Some("b".to_string()), r#"{"seq":0,"type":"offer"}"#.to_string()),
            (None, r#"{"type":"hello"}"#.to_string()),
            (Some("ghost".to_string()), r#"{"seq":0}"#.to_string()),
        ];
        assert_eq!(store.poll("r", "a", batch), PollReply::Messages(vec![]));
        assert_eq!(
            drain(&store, "r", "b"),
            vec![
                json!({"from": "a", "data": r#"{"seq":0,"type":"offer"}"#}),
                json!({"from": "a", "data": r#"{"type":"hello"}"#}),
            ]
        );
        assert_eq!(
            drain(&store, "r", "c"),
            vec![json!({"from": "a", "data": r#"{"type":"hello"}"#})]
        );
    }

    #[test]
    fn unknown_rooms_and_clients_are_disconnected() {
        let store = RoomStore::new(8);
        assert_eq!(store.poll("nowhere", "a", Vec::new()), PollReply::Disconnected);
        store.connect("r", "a");
        assert_eq!(store.poll("r", "stranger", Vec::new()), PollReply::Disconnected);
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let store = RoomStore::new(8);
        store.connect("r", "a");
        assert_eq!(store.room_count(), 1);
        store.disconnect("r", "a");
        assert_eq!(store.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_are_reaped() {
        let store = RoomStore::new(8);
        store.connect("r", "a");
        store.connect("r", "b");
        tokio::time::advance(Duration::from_secs(20)).await;
        drain(&store, "r", "b");
        tokio::time::advance(Duration::from_secs(20)).await;

        let reaped = store.reap(Duration::from_secs(30));
        assert_eq!(reaped, vec![("r".to_string(), "a".to_string())]);
        assert_eq!(
            drain(&store, "r", "b"),
            vec![json!({"type": "disconnected", "peer": "a", "clients": ["b"]})]
        );
    }
}
