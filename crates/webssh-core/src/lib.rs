//! webssh-core: shared types for the webssh terminal gateway.
//!
//! Provides the session start message, the UTF-8 output decoder, the remote
//! shell capability trait, and the crate-wide error type.

pub mod codec;
pub mod error;
pub mod messages;
pub mod shell;

// Re-export commonly used items at crate root.
pub use codec::Utf8Decoder;
pub use error::{WebSshError, WebSshResult};
pub use messages::{decode_session_config, Credential, SessionConfig, TerminalMode};
pub use shell::{BoxFuture, ShellFactory, ShellHandler, ShellOutput};
