//! SSH connector: the russh-backed `ShellHandler`.
//!
//! Dials the remote, authenticates with the password from the session start
//! message (or with no credential at all when it is empty), opens a session
//! channel, requests a pty and starts a shell. Both requests are sent with
//! `want_reply` and must be acknowledged before the session goes live.
//!
//! Host keys are accepted without verification. This gateway trusts every
//! server it is pointed at and must only be deployed on trusted networks.
//!
//! Out-of-band requests from the server (keepalives, exit-status, ...) are
//! consumed by the russh connection task for the lifetime of the handle;
//! requests that want a reply are answered with a failure there.

use crate::config::SshSettings;
use russh::client::{self, AuthResult, Handle};
use russh::{Channel, ChannelMsg, ChannelStream, Disconnect, Pty};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webssh_core::messages::{
    TerminalMode, PTY_PIXEL_HEIGHT, PTY_PIXEL_WIDTH, TERMINAL_MODES, TERM_TYPE,
};
use webssh_core::{
    BoxFuture, Credential, SessionConfig, ShellFactory, ShellHandler, ShellOutput, WebSshError,
    WebSshResult,
};

/// Parameters of the pty-request sent for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: &'static str,
    pub cols: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub modes: Vec<(TerminalMode, u32)>,
}

impl PtyRequest {
    /// Request for the dimensions given in the session start message.
    pub fn for_config(config: &SessionConfig) -> Self {
        Self {
            term: TERM_TYPE,
            cols: config.cols,
            rows: config.rows,
            pixel_width: PTY_PIXEL_WIDTH,
            pixel_height: PTY_PIXEL_HEIGHT,
            modes: TERMINAL_MODES.to_vec(),
        }
    }

    fn russh_modes(&self) -> Vec<(Pty, u32)> {
        self.modes
            .iter()
            .map(|&(mode, value)| (pty_opcode(mode), value))
            .collect()
    }
}

fn pty_opcode(mode: TerminalMode) -> Pty {
    match mode {
        TerminalMode::Echo => Pty::ECHO,
        TerminalMode::EchoErase => Pty::ECHOE,
        TerminalMode::ExtendedInput => Pty::IEXTEN,
        TerminalMode::Signals => Pty::ISIG,
        TerminalMode::InputSpeed => Pty::TTY_OP_ISPEED,
        TerminalMode::OutputSpeed => Pty::TTY_OP_OSPEED,
    }
}

type ChannelWriter = WriteHalf<ChannelStream<client::Msg>>;

/// One authenticated SSH connection and its single shell channel.
pub struct SshShell {
    settings: SshSettings,
    /// Whether the session start message carried a password.
    password_auth: bool,
    session_id: String,
    handle: Mutex<Option<Handle<ClientHandler>>>,
    writer: Mutex<Option<ChannelWriter>>,
    output: Mutex<Option<ShellOutput>>,
    connected: bool,
}

impl SshShell {
    pub fn new(settings: SshSettings, password_auth: bool) -> Self {
        Self {
            settings,
            password_auth,
            session_id: String::new(),
            handle: Mutex::new(None),
            writer: Mutex::new(None),
            output: Mutex::new(None),
            connected: false,
        }
    }

    /// Factory producing an unconnected `SshShell` per session.
    pub fn factory(settings: SshSettings) -> ShellFactory {
        Arc::new(move |config: &SessionConfig| {
            Box::new(SshShell::new(settings, config.has_password())) as Box<dyn ShellHandler>
        })
    }

    async fn establish(&mut self, config: &SessionConfig) -> WebSshResult<()> {
        let port = config.port_number()?;
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.settings.keepalive_interval,
            ..client::Config::default()
        });
        let handler = ClientHandler {
            session_id: self.session_id.clone(),
        };

        info!(
            session_id = %self.session_id,
            target = %config.target(),
            user = %config.hostname,
            password_auth = self.password_auth,
            "dialing SSH server"
        );

        // 1. Dial + auth
        let handle = client::connect(ssh_config, (config.address.as_str(), port), handler)
            .await
            .map_err(|e| WebSshError::Dial(format!("{}: {e}", config.target())))?;
        let handle = self.handle.get_mut().insert(handle);
        authenticate(handle, config).await?;
        debug!(session_id = %self.session_id, "SSH authentication succeeded");

        // 2. Session channel
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| WebSshError::ChannelOpen(e.to_string()))?;

        // 3. Pseudo-terminal
        let pty = PtyRequest::for_config(config);
        let mut early_output = Vec::new();
        channel
            .request_pty(
                true,
                pty.term,
                pty.cols,
                pty.rows,
                pty.pixel_width,
                pty.pixel_height,
                &pty.russh_modes(),
            )
            .await
            .map_err(|e| WebSshError::PtyRequest(e.to_string()))?;
        await_reply(&mut channel, &mut early_output)
            .await
            .map_err(WebSshError::PtyRequest)?;
        debug!(session_id = %self.session_id, cols = pty.cols, rows = pty.rows, "pty allocated");

        // 4. Shell
        channel
            .request_shell(true)
            .await
            .map_err(|e| WebSshError::ShellRequest(e.to_string()))?;
        await_reply(&mut channel, &mut early_output)
            .await
            .map_err(WebSshError::ShellRequest)?;

        let (reader, writer) = tokio::io::split(channel.into_stream());
        let output: ShellOutput = Box::new(std::io::Cursor::new(early_output).chain(reader));
        *self.writer.get_mut() = Some(writer);
        *self.output.get_mut() = Some(output);
        self.connected = true;

        info!(session_id = %self.session_id, "shell started");
        Ok(())
    }
}

impl ShellHandler for SshShell {
    fn connect<'a>(
        &'a mut self,
        session_id: &'a str,
        config: &'a SessionConfig,
    ) -> BoxFuture<'a, WebSshResult<()>> {
        Box::pin(async move {
            self.session_id = session_id.to_string();
            let limit = self.settings.connect_timeout;
            tokio::time::timeout(limit, self.establish(config))
                .await
                .map_err(|_| WebSshError::Timeout)?
        })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, WebSshResult<()>> {
        Box::pin(async move {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(WebSshError::Closed)?;
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    fn read(&mut self) -> WebSshResult<ShellOutput> {
        if !self.connected {
            return Err(WebSshError::NotConnected);
        }
        self.output.get_mut().take().ok_or(WebSshError::ReaderTaken)
    }

    fn close(&self) -> BoxFuture<'_, WebSshResult<()>> {
        Box::pin(async move {
            // A writer stuck on a full window holds the lock; skip the EOF
            // then, the disconnect below releases it.
            let writer = match self.writer.try_lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => None,
            };
            if let Some(mut writer) = writer {
                if let Err(e) = writer.shutdown().await {
                    debug!(session_id = %self.session_id, error = %e, "channel EOF failed");
                }
            }

            let handle = self.handle.lock().await.take();
            if let Some(handle) = handle {
                if let Err(e) = handle
                    .disconnect(Disconnect::ByApplication, "session closed", "en")
                    .await
                {
                    // the transport may already be down
                    warn!(session_id = %self.session_id, error = %e, "SSH disconnect failed");
                }
                info!(session_id = %self.session_id, "SSH session closed");
            }
            Ok(())
        })
    }
}

/// Offer the session's credentials in order; with none, try the `none` method.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &SessionConfig,
) -> WebSshResult<()> {
    let credentials = config.credentials();
    if credentials.is_empty() {
        let result = handle
            .authenticate_none(config.hostname.as_str())
            .await
            .map_err(|e| WebSshError::Auth(e.to_string()))?;
        return auth_outcome(result);
    }

    let mut last = WebSshError::Auth("no credential accepted".into());
    for credential in credentials {
        let result = match credential {
            Credential::Password(password) => handle
                .authenticate_password(config.hostname.as_str(), password)
                .await
                .map_err(|e| WebSshError::Auth(e.to_string()))?,
        };
        match auth_outcome(result) {
            Ok(()) => return Ok(()),
            Err(e) => last = e,
        }
    }
    Err(last)
}

fn auth_outcome(result: AuthResult) -> WebSshResult<()> {
    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods, ..
        } => Err(WebSshError::Auth(format!(
            "rejected, remaining methods: {remaining_methods:?}"
        ))),
    }
}

/// Wait for the reply to a `want_reply` channel request.
///
/// Output that races ahead of the reply is kept in `early_output`.
async fn await_reply(
    channel: &mut Channel<client::Msg>,
    early_output: &mut Vec<u8>,
) -> Result<(), String> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => return Err("request refused by server".into()),
            Some(ChannelMsg::Data { data }) => early_output.extend_from_slice(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err("channel closed before reply".into())
            }
            Some(other) => debug!(?other, "ignoring channel message while awaiting reply"),
        }
    }
}

/// russh event handler for one connection.
pub struct ClientHandler {
    session_id: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            session_id = %self.session_id,
            key_type = ?server_public_key.algorithm(),
            "accepting server host key without verification"
        );
        Ok(true)
    }
}
