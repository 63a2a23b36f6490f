//! Per-session state machine and the single teardown path.
//!
//! Every activity of a session holds the same `SessionControl`. The state
//! lives in a watch channel: activities wait on it to learn that the session
//! is stopping, and `teardown` moves it out of `Starting`/`Active` under the
//! channel's lock, so only one caller ever runs the release sequence.

use super::registry::SessionRegistry;
use crate::transport::websocket::BrowserSocket;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};
use webssh_core::ShellHandler;

/// Lifecycle of one terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transports are up, activities are being spawned.
    Starting,
    /// All activities are running.
    Active,
    /// Teardown has begun; activity I/O is abandoned.
    Closing,
    /// Both transports are released and the registry entry is gone.
    Closed,
}

impl SessionState {
    /// Whether activities should stop.
    pub fn is_stopping(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

/// Shared handle owning both transports of a live session.
pub struct SessionControl {
    session_id: String,
    token: u64,
    socket: Arc<BrowserSocket>,
    shell: Arc<dyn ShellHandler>,
    registry: Arc<SessionRegistry>,
    state: watch::Sender<SessionState>,
}

impl SessionControl {
    pub fn new(
        session_id: String,
        token: u64,
        socket: Arc<BrowserSocket>,
        shell: Arc<dyn ShellHandler>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            session_id,
            token,
            socket,
            shell,
            registry,
            state,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn socket(&self) -> &Arc<BrowserSocket> {
        &self.socket
    }

    #[cfg(test)]
    pub fn shell(&self) -> &Arc<dyn ShellHandler> {
        &self.shell
    }

    /// Mark the session active. Fails if teardown already started.
    pub fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once teardown has started.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        // the sender lives in `self`, so this cannot fail
        let _ = rx.wait_for(|state| state.is_stopping()).await;
    }

    /// Resolves once teardown has finished.
    #[cfg(test)]
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Release both transports and the registry entry.
    ///
    /// Safe to call from any activity, any number of times, concurrently.
    /// Returns `true` for the one call that performed the teardown.
    pub async fn teardown(&self, reason: &str) -> bool {
        let first = self.state.send_if_modified(|state| match state {
            SessionState::Starting | SessionState::Active => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        });
        if !first {
            debug!(session_id = %self.session_id, reason, "teardown already in progress");
            return false;
        }

        info!(session_id = %self.session_id, reason, "tearing down session");

        if let Err(e) = self.socket.close(CloseCode::Normal, "session closed").await {
            debug!(session_id = %self.session_id, error = %e, "browser close failed");
        }
        if let Err(e) = self.shell.close().await {
            warn!(session_id = %self.session_id, error = %e, "shell close failed");
        }
        self.registry.remove(&self.session_id, self.token).await;

        self.state.send_replace(SessionState::Closed);
        info!(session_id = %self.session_id, "session closed");
        true
    }
}
