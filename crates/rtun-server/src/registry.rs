//! Live session bookkeeping
//!
//! Sessions never read each other's entries; the registry exists for the
//! server loop's logs and for introspection.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Snapshot of one live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub public_port: u16,
    pub ephemeral: bool,
    pub established_at: Instant,
}

/// Registry of live sessions keyed by session id
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionInfo>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a connection that is about to handshake
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, info: SessionInfo) {
        self.sessions.insert(info.id, info);
    }

    pub fn remove(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.remove(&id).map(|(_, info)| info)
    }

    /// Find the live session serving `port`
    pub fn find_by_port(&self, port: u16) -> Option<SessionInfo> {
        self.sessions
            .iter()
            .find(|entry| entry.public_port == port)
            .map(|entry| entry.value().clone())
    }

    /// All live sessions, ordered by id
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|info| info.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
