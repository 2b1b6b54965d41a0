use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::rtc::PeerConnection;

/// A connected remote peer and its point-to-point connection.
#[derive(Clone)]
pub struct PeerHandle {
    pub id: String,
    pub connection: Arc<dyn PeerConnection>,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("state", &self.connection.state())
            .finish()
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.connection, &other.connection)
    }
}

#[derive(Default)]
struct Entries {
    local: Option<String>,
    peers: HashMap<String, PeerHandle>,
}

/// Read view of the peer set. Only the negotiator inserts and removes entries.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<RwLock<Entries>>,
}

impl PeerDirectory {
    pub fn local_peer(&self) -> Option<String> {
        self.inner.read().local.clone()
    }

    pub fn get(&self, id: &str) -> Option<PeerHandle> {
        self.inner.read().peers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().peers.contains_key(id)
    }

    pub fn handles(&self) -> Vec<PeerHandle> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn set_local(&self, peer: String) {
        self.inner.write().local = Some(peer);
    }

    pub(crate) fn insert(&self, handle: PeerHandle) {
        self.inner.write().peers.insert(handle.id.clone(), handle);
    }

    pub(crate) fn remove(&self, id: &str) -> Option<PeerHandle> {
        self.inner.write().peers.remove(id)
    }

    pub(crate) fn drain(&self) -> Vec<PeerHandle> {
        self.inner.write().peers.drain().map(|(_, handle)| handle).collect()
    }
}
