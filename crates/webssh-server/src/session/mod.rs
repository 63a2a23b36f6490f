//! Terminal sessions: registry, lifecycle, relays, and session start.

pub mod lifecycle;
pub mod registry;
pub mod relay;

pub use lifecycle::SessionControl;
pub use registry::SessionRegistry;

use crate::config::RelaySettings;
use crate::transport::websocket::{BrowserInbound, BrowserSocket};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use webssh_core::{decode_session_config, ShellFactory, ShellHandler, WebSshError, WebSshResult};

/// Process-wide state every session is started with.
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub factory: ShellFactory,
    pub relay: RelaySettings,
    /// Flips to `true` when the server shuts down.
    pub shutdown: watch::Receiver<bool>,
}

/// Drive one upgraded browser connection from registration to `Active`.
///
/// Reads the session start message, connects the remote shell and spawns the
/// session's activities. On any setup failure the browser gets a close frame
/// (1008 for a bad or late start message, 1011 when the remote cannot be
/// reached), the registry entry is removed and the error is returned.
pub async fn start_session<S>(
    ws: WebSocketStream<S>,
    session_id: String,
    remote_addr: SocketAddr,
    ctx: &SessionContext,
) -> WebSshResult<Arc<SessionControl>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (socket, mut inbound) = BrowserSocket::split(ws);
    let token = ctx
        .registry
        .insert(&session_id, remote_addr, socket.clone())
        .await;
    let setup = Setup {
        session_id: &session_id,
        token,
        socket: &socket,
        ctx,
    };

    // Session start message
    let first = match first_payload(&mut inbound, ctx.shutdown.clone(), ctx.relay.start_timeout)
        .await
    {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            setup.abort(CloseCode::Away, "closed before start").await;
            return Err(WebSshError::Closed);
        }
        Err(WebSshError::Timeout) => {
            warn!(
                session_id = %session_id,
                timeout_secs = ctx.relay.start_timeout.as_secs(),
                "no session start message in time"
            );
            setup.abort(CloseCode::Policy, "session start timeout").await;
            return Err(WebSshError::Timeout);
        }
        Err(e) => {
            setup.abort(CloseCode::Error, "read failed").await;
            return Err(e);
        }
    };
    let config = match decode_session_config(&first) {
        Ok(config) => config,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "invalid session start message");
            setup.abort(CloseCode::Policy, "invalid session config").await;
            return Err(e);
        }
    };
    debug!(session_id = %session_id, config = ?config, "session start message");

    // Remote shell
    let mut shell = (ctx.factory)(&config);
    let connected = {
        let mut shutdown = ctx.shutdown.clone();
        tokio::select! {
            connected = shell.connect(&session_id, &config) => connected,
            true = shutting_down(&mut shutdown) => Err(WebSshError::Closed),
        }
    };
    if let Err(e) = connected {
        let (code, reason) = match e {
            WebSshError::Closed => (CloseCode::Away, "server shutting down"),
            _ => (CloseCode::Error, "ssh connect failed"),
        };
        warn!(
            session_id = %session_id,
            target = %config.target(),
            error = %e,
            "remote shell setup failed"
        );
        if let Err(close_err) = shell.close().await {
            debug!(session_id = %session_id, error = %close_err, "partial shell close failed");
        }
        setup.abort(code, reason).await;
        return Err(e);
    }
    let output = match shell.read() {
        Ok(output) => output,
        Err(e) => {
            if let Err(close_err) = shell.close().await {
                debug!(session_id = %session_id, error = %close_err, "shell close failed");
            }
            setup.abort(CloseCode::Error, "ssh connect failed").await;
            return Err(e);
        }
    };
    let shell: Arc<dyn ShellHandler> = Arc::from(shell);

    let control = Arc::new(SessionControl::new(
        session_id.clone(),
        token,
        socket.clone(),
        shell.clone(),
        ctx.registry.clone(),
    ));

    // Activities
    let settings = ctx.relay;
    let (command_tx, command_rx) = mpsc::channel(settings.command_queue);
    let (output_tx, output_rx) = mpsc::channel(settings.output_queue);
    control.activate();

    tokio::spawn(relay::browser_reader(inbound, command_tx, control.clone()));
    tokio::spawn(relay::input_relay(command_rx, shell, control.clone()));
    tokio::spawn(relay::output_reader(output, output_tx, control.clone()));
    tokio::spawn(relay::batching_relay(
        output_rx,
        socket.clone(),
        control.clone(),
        settings.flush_interval,
    ));
    tokio::spawn(relay::keepalive(
        socket,
        control.clone(),
        settings.keepalive_interval,
        settings.write_deadline,
    ));
    tokio::spawn(watch_shutdown(ctx.shutdown.clone(), control.clone()));

    info!(
        session_id = %session_id,
        remote = %remote_addr,
        target = %config.target(),
        user = %config.hostname,
        "session active"
    );
    Ok(control)
}

/// Browser-side resources of a session that has not reached `Active`.
struct Setup<'a> {
    session_id: &'a str,
    token: u64,
    socket: &'a Arc<BrowserSocket>,
    ctx: &'a SessionContext,
}

impl Setup<'_> {
    async fn abort(&self, code: CloseCode, reason: &str) {
        if let Err(e) = self.socket.close(code, reason).await {
            debug!(session_id = %self.session_id, error = %e, "close after failed setup");
        }
        self.ctx.registry.remove(self.session_id, self.token).await;
        info!(session_id = %self.session_id, reason, "session setup aborted");
    }
}

/// The first browser payload, `None` if the browser or the server goes away
/// first. Fails with `Timeout` once `deadline` passes.
async fn first_payload(
    inbound: &mut BrowserInbound,
    mut shutdown: watch::Receiver<bool>,
    deadline: Duration,
) -> WebSshResult<Option<Vec<u8>>> {
    tokio::select! {
        payload = tokio::time::timeout(deadline, inbound.next_payload()) => {
            payload.map_err(|_| WebSshError::Timeout)?
        }
        true = shutting_down(&mut shutdown) => Ok(None),
    }
}

/// Resolves to `true` once the server starts shutting down.
async fn shutting_down(shutdown: &mut watch::Receiver<bool>) -> bool {
    shutdown.wait_for(|down| *down).await.is_ok()
}

/// Tear the session down when the server shuts down.
async fn watch_shutdown(mut shutdown: watch::Receiver<bool>, control: Arc<SessionControl>) {
    tokio::select! {
        _ = control.stopped() => {}
        true = shutting_down(&mut shutdown) => {
            control.teardown("server shutting down").await;
        }
    }
}
