//! Process-wide session registry.
//!
//! Maps the session identifier taken from the upgrade path to the browser
//! socket serving it. Bookkeeping only: relays never route through it.

use crate::transport::websocket::BrowserSocket;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A registered browser connection.
#[derive(Clone)]
pub struct RegistryEntry {
    /// Session identifier from the URL path.
    pub session_id: String,
    /// Remote address of the browser.
    pub remote_addr: SocketAddr,
    /// The browser socket's send half.
    pub socket: Arc<BrowserSocket>,
    /// Distinguishes successive connections reusing one session id.
    pub token: u64,
    /// When the entry was inserted.
    pub registered_at: Instant,
}

/// Summary returned when listing sessions.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub remote_addr: SocketAddr,
    pub age_secs: u64,
    /// Whether the browser socket has not been closed yet.
    pub browser_open: bool,
}

/// Mutex-protected map of active sessions.
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    next_token: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a browser socket under `session_id`, returning its token.
    ///
    /// An existing entry with the same id is replaced; its own teardown will
    /// then leave the new entry alone because the tokens differ.
    pub async fn insert(
        &self,
        session_id: &str,
        remote_addr: SocketAddr,
        socket: Arc<BrowserSocket>,
    ) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = RegistryEntry {
            session_id: session_id.to_string(),
            remote_addr,
            socket,
            token,
            registered_at: Instant::now(),
        };

        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.insert(session_id.to_string(), entry) {
            warn!(
                session_id,
                old_remote = %old.remote_addr,
                new_remote = %remote_addr,
                "session id reused, replacing registry entry"
            );
        }
        info!(session_id, token, count = entries.len(), "session registered");
        token
    }

    /// Remove the entry for `session_id` if it still carries `token`.
    ///
    /// Returns whether an entry was removed.
    pub async fn remove(&self, session_id: &str, token: u64) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(session_id) {
            Some(entry) if entry.token == token => {
                entries.remove(session_id);
                debug!(session_id, token, count = entries.len(), "session unregistered");
                true
            }
            _ => false,
        }
    }

    /// Look up the browser socket registered under `session_id`.
    #[cfg(test)]
    pub async fn get(&self, session_id: &str) -> Option<Arc<BrowserSocket>> {
        let entries = self.entries.lock().await;
        entries.get(session_id).map(|e| e.socket.clone())
    }

    /// List all registered sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .map(|e| SessionInfo {
                session_id: e.session_id.clone(),
                remote_addr: e.remote_addr,
                age_secs: e.registered_at.elapsed().as_secs(),
                browser_open: !e.socket.is_closed(),
            })
            .collect()
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
