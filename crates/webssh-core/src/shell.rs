//! Remote shell capability trait.
//!
//! The session relays only ever talk to a remote terminal through these four
//! operations, so the SSH implementation can be swapped for a test double.

use crate::error::WebSshResult;
use crate::messages::SessionConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Boxed `Send` future returned by trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw terminal output produced by the remote shell. Yields 0 bytes at EOF.
pub type ShellOutput = Box<dyn AsyncRead + Send + Unpin>;

/// A remote interactive shell behind a pseudo-terminal.
///
/// Lifecycle: `connect` once, `read` once to take the output stream, then
/// `write` and `close` may be called concurrently from any task.
pub trait ShellHandler: Send + Sync {
    /// Establish the remote session: dial, authenticate, open a channel,
    /// allocate the pty and start the shell.
    fn connect<'a>(
        &'a mut self,
        session_id: &'a str,
        config: &'a SessionConfig,
    ) -> BoxFuture<'a, WebSshResult<()>>;

    /// Write terminal input bytes.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, WebSshResult<()>>;

    /// Take the terminal output stream. Not restartable: a second call fails.
    fn read(&mut self) -> WebSshResult<ShellOutput>;

    /// Close the channel and then the connection. Safe to call repeatedly.
    fn close(&self) -> BoxFuture<'_, WebSshResult<()>>;
}

/// Builds an unconnected handler for a freshly parsed session config.
pub type ShellFactory = Arc<dyn Fn(&SessionConfig) -> Box<dyn ShellHandler> + Send + Sync>;
