use thiserror::Error;

/// Errors produced by the webssh gateway.
#[derive(Debug, Error)]
pub enum WebSshError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("channel open failed: {0}")]
    ChannelOpen(String),

    #[error("pty request failed: {0}")]
    PtyRequest(String),

    #[error("shell request failed: {0}")]
    ShellRequest(String),

    #[error("invalid session config: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session closed")]
    Closed,

    #[error("shell not connected")]
    NotConnected,

    #[error("terminal output reader already taken")]
    ReaderTaken,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl WebSshError {
    /// Whether this error was raised while establishing the remote shell.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            WebSshError::Dial(_)
                | WebSshError::Auth(_)
                | WebSshError::ChannelOpen(_)
                | WebSshError::PtyRequest(_)
                | WebSshError::ShellRequest(_)
                | WebSshError::Timeout
        )
    }
}

pub type WebSshResult<T> = Result<T, WebSshError>;
