//! Wire types exchanged with the browser and the parameters sent to the
//! remote SSH server when the terminal is negotiated.

use crate::error::{WebSshError, WebSshResult};
use serde::{Deserialize, Serialize};

/// Terminal type announced in the pty-request.
pub const TERM_TYPE: &str = "xterm";

/// Pixel-size hint sent with the pty-request (width, height).
pub const PTY_PIXEL_WIDTH: u32 = 32 * 8;
pub const PTY_PIXEL_HEIGHT: u32 = 160 * 8;

/// Line speed reported for both input and output in the terminal modes.
pub const TTY_BAUD: u32 = 115_200;

/// Terminal modes requested with the pty.
///
/// Opcodes follow RFC 4254 §8; values are booleans (1) except the baud rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    Echo,
    EchoErase,
    ExtendedInput,
    Signals,
    InputSpeed,
    OutputSpeed,
}

impl TerminalMode {
    /// RFC 4254 opcode.
    pub fn opcode(self) -> u8 {
        match self {
            TerminalMode::Echo => 53,
            TerminalMode::EchoErase => 54,
            TerminalMode::ExtendedInput => 59,
            TerminalMode::Signals => 50,
            TerminalMode::InputSpeed => 128,
            TerminalMode::OutputSpeed => 129,
        }
    }
}

/// The mode list carried by every pty-request.
pub const TERMINAL_MODES: [(TerminalMode, u32); 6] = [
    (TerminalMode::Echo, 1),
    (TerminalMode::InputSpeed, TTY_BAUD),
    (TerminalMode::OutputSpeed, TTY_BAUD),
    (TerminalMode::EchoErase, 1),
    (TerminalMode::ExtendedInput, 1),
    (TerminalMode::Signals, 1),
];

/// Session start message: the first frame a browser sends after the upgrade.
///
/// `hostname` is the SSH login name, `address`/`port` locate the remote host.
/// An empty password means no credential is offered at all.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub rows: u32,
    #[serde(default)]
    pub cols: u32,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("hostname", &self.hostname)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("address", &self.address)
            .field("port", &self.port)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

/// A credential offered to the remote during user authentication.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
        }
    }
}

impl SessionConfig {
    /// Credentials to offer, in order. Empty when no password was supplied.
    pub fn credentials(&self) -> Vec<Credential> {
        if self.password.is_empty() {
            Vec::new()
        } else {
            vec![Credential::Password(self.password.clone())]
        }
    }

    /// Whether a password credential will be offered.
    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }

    /// Remote port as a number.
    pub fn port_number(&self) -> WebSshResult<u16> {
        self.port
            .trim()
            .parse::<u16>()
            .map_err(|e| WebSshError::InvalidConfig(format!("port {:?}: {e}", self.port)))
    }

    /// `address:port` as dialled, for logging.
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Parse a session start message from raw frame bytes (text or binary).
pub fn decode_session_config(data: &[u8]) -> WebSshResult<SessionConfig> {
    let config: SessionConfig = serde_json::from_slice(data)?;
    if config.address.is_empty() {
        return Err(WebSshError::InvalidConfig("address is empty".into()));
    }
    config.port_number()?;
    Ok(config)
}
