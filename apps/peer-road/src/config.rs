use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

/// TURN entry handed to every joining client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoadConfig {
    pub addr: SocketAddr,
    pub prefix: String,
    pub max_clients: usize,
    /// Clients that have not polled for this long are dropped from their room.
    pub client_ttl: Duration,
    pub turn: Option<TurnConfig>,
}

impl Default for RoadConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            prefix: "/channel".to_string(),
            max_clients: 8,
            client_ttl: Duration::from_secs(30),
            turn: None,
        }
    }
}

impl RoadConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let addr = env::var("PEER_ROAD_ADDR")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.addr);
        let prefix = env::var("PEER_ROAD_PREFIX").unwrap_or(defaults.prefix);
        let max_clients = env::var("PEER_ROAD_MAX_CLIENTS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .filter(|value: &usize| *value > 0)
            .unwrap_or(defaults.max_clients);
        let client_ttl = env::var("PEER_ROAD_CLIENT_TTL_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.client_ttl);
        let turn = env::var("PEER_ROAD_TURN_URL").ok().map(|url| TurnConfig {
            url,
            username: env::var("PEER_ROAD_TURN_USERNAME").ok(),
            credential: env::var("PEER_ROAD_TURN_CREDENTIAL").ok(),
        });

        Self {
            addr,
            prefix,
            max_clients,
            client_ttl,
            turn,
        }
    }

    /// Prefix as a route fragment: leading slash, no trailing slash, empty for the root.
    pub fn route_prefix(&self) -> String {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }

    pub fn reap_interval(&self) -> Duration {
        (self.client_ttl / 2).max(Duration::from_millis(100))
    }
}
