use std::env;
use std::time::Duration;

use rand::Rng;
use url::Url;

use crate::error::{Result, SignalError};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";
const DEFAULT_PREFIX: &str = "/channel";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Backoff applied when the rendezvous point reports the room as full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform random jitter added to every delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// `2^attempt * base + random(0, jitter)`.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let base = self.base_delay.saturating_mul(factor);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..jitter_ms))
        };
        base + jitter
    }
}

/// Bounds for the per-sender out-of-order buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderPolicy {
    pub max_pending: usize,
    pub gap_timeout: Duration,
}

impl Default for ReorderPolicy {
    fn default() -> Self {
        Self {
            max_pending: 256,
            gap_timeout: Duration::from_secs(10),
        }
    }
}

impl ReorderPolicy {
    /// How often buffered gaps are checked against `gap_timeout`.
    pub fn sweep_interval(&self) -> Duration {
        (self.gap_timeout / 4).max(Duration::from_millis(50))
    }
}

/// peer-data client configuration
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Base URL of the rendezvous server, without the prefix.
    pub server: String,
    pub prefix: String,
    pub room: String,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub reorder: ReorderPolicy,
    /// Skip the public STUN defaults (local testing).
    pub disable_stun: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            room: "lobby".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
            reorder: ReorderPolicy::default(),
            disable_stun: false,
        }
    }
}

impl SignalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let server = env::var("PEER_DATA_SERVER").unwrap_or(defaults.server);
        // localhost resolves to ::1 first on some hosts while the server binds IPv4
        let server = if server.contains("://localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        let prefix = env::var("PEER_DATA_PREFIX").unwrap_or(defaults.prefix);
        let room = env::var("PEER_DATA_ROOM").unwrap_or(defaults.room);
        let poll_interval = env::var("PEER_DATA_POLL_INTERVAL_MS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let max_attempts = env::var("PEER_DATA_RETRY_ATTEMPTS")
            .ok()
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(defaults.retry.max_attempts);
        let max_pending = env::var("PEER_DATA_MAX_PENDING")
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.reorder.max_pending);
        let gap_timeout = env::var("PEER_DATA_GAP_TIMEOUT_MS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.reorder.gap_timeout);
        let disable_stun = env::var("PEER_DATA_DISABLE_STUN")
            .map(|raw| matches!(raw.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            server,
            prefix,
            room,
            poll_interval,
            retry: RetryPolicy {
                max_attempts,
                ..defaults.retry
            },
            reorder: ReorderPolicy {
                max_pending,
                gap_timeout,
            },
            disable_stun,
        }
    }

    /// Join URL: `<server><prefix>/<room>`.
    pub fn room_url(&self) -> Result<String> {
        validate_room(&self.room)?;
        let base = Url::parse(&self.server)
            .map_err(|_| SignalError::InvalidServer(self.server.clone()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SignalError::InvalidServer(self.server.clone()));
        }
        Ok(format!(
            "{}{}/{}",
            self.server.trim_end_matches('/'),
            normalize_prefix(&self.prefix),
            self.room
        ))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// Room names become a path segment, so they share the channel label alphabet.
pub fn validate_room(room: &str) -> Result<()> {
    let valid = !room.is_empty()
        && room
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(SignalError::InvalidRoom(room.to_string()))
    }
}
