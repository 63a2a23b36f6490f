//! Core server: accepts browser connections and starts terminal sessions.
//!
//! Owns the session registry and the shell factory. Coordinates the lifecycle
//! of all incoming connections and tears every session down on shutdown.

use crate::config::ServerConfig;
use crate::session::{self, SessionContext, SessionRegistry};
use crate::ssh::SshShell;
use crate::transport::websocket::{self, UpgradeGate};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webssh_core::{ShellFactory, WebSshError, WebSshResult};

/// How long shutdown waits for sessions to finish tearing down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The webssh server instance.
pub struct WebSshServer {
    /// Server configuration.
    config: ServerConfig,
    /// Active sessions, keyed by session id.
    registry: Arc<SessionRegistry>,
    /// Builds the remote shell for each session.
    factory: ShellFactory,
}

impl WebSshServer {
    /// Create a server whose sessions connect over SSH.
    pub fn new(config: ServerConfig) -> Self {
        let factory = SshShell::factory(config.ssh);
        Self::with_factory(config, factory)
    }

    /// Create a server with a custom shell factory.
    pub fn with_factory(config: ServerConfig, factory: ShellFactory) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            factory,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> WebSshResult<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| {
                WebSshError::Transport(format!("bind {}: {e}", self.config.listen_addr))
            })?;
        self.run_on(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn run_on(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> WebSshResult<()> {
        let gate = Arc::new(UpgradeGate {
            path_prefix: self.config.path_prefix.clone(),
            max_sessions: self.config.max_sessions,
            registry: self.registry.clone(),
        });
        let mut ws_rx = websocket::start_listener(listener, gate);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(SessionContext {
            registry: self.registry.clone(),
            factory: self.factory.clone(),
            relay: self.config.relay,
            shutdown: shutdown_rx,
        });

        info!(
            addr = %self.config.listen_addr,
            prefix = %self.config.path_prefix,
            max_sessions = self.config.max_sessions,
            flush_ms = self.config.relay.flush_interval.as_millis() as u64,
            "webssh-server ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                conn = ws_rx.recv() => {
                    let Some(conn) = conn else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let session_id = conn.session_id.clone();
                        let remote = conn.remote_addr;
                        info!(remote = %remote, session_id = %session_id, "handling WebSocket connection");
                        if let Err(e) =
                            session::start_session(conn.ws_stream, conn.session_id, remote, &ctx)
                                .await
                        {
                            warn!(
                                remote = %remote,
                                session_id = %session_id,
                                error = %e,
                                "session did not start"
                            );
                        }
                    });
                }
            }
        }

        // Stop accepting, then tear every session down
        drop(ws_rx);
        let active = self.registry.count().await;
        info!(sessions = active, "closing active sessions");
        shutdown_tx.send_replace(true);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.registry.count().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        match drained {
            Ok(()) => debug!("all sessions closed"),
            Err(_) => {
                for info in self.registry.list().await {
                    warn!(
                        session_id = %info.session_id,
                        remote = %info.remote_addr,
                        age_secs = info.age_secs,
                        browser_open = info.browser_open,
                        "session still open after shutdown grace period"
                    );
                }
            }
        }
        Ok(())
    }
}
