//! The concurrent activities of a live session.
//!
//! ```text
//! browser ──▶ browser_reader ──[commands]──▶ input_relay ──▶ shell
//! shell   ──▶ output_reader  ──[units]────▶ batching_relay ──▶ browser
//!                                           keepalive ──ping──▶ browser
//! ```
//!
//! Each activity selects on the session's stop signal before every blocking
//! step and routes every fatal condition through `SessionControl::teardown`.

use super::lifecycle::SessionControl;
use crate::transport::websocket::{BrowserInbound, BrowserSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};
use webssh_core::{ShellHandler, ShellOutput, Utf8Decoder};

/// Size of one read from the shell output stream.
const READ_CHUNK: usize = 8192;

/// Read browser frames and queue them for the input relay.
pub async fn browser_reader(
    mut inbound: BrowserInbound,
    commands: mpsc::Sender<Vec<u8>>,
    control: Arc<SessionControl>,
) {
    let session_id = control.session_id().to_string();
    loop {
        let payload = tokio::select! {
            _ = control.stopped() => return,
            payload = inbound.next_payload() => payload,
        };
        match payload {
            Ok(Some(data)) => {
                trace!(session_id = %session_id, len = data.len(), "browser frame");
                tokio::select! {
                    _ = control.stopped() => return,
                    sent = commands.send(data) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                control.teardown("browser closed the connection").await;
                return;
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "browser read failed");
                control.teardown("browser read failed").await;
                return;
            }
        }
    }
}

/// Write queued browser input to the shell, in order, unmodified.
pub async fn input_relay(
    mut commands: mpsc::Receiver<Vec<u8>>,
    shell: Arc<dyn ShellHandler>,
    control: Arc<SessionControl>,
) {
    loop {
        let data = tokio::select! {
            _ = control.stopped() => return,
            data = commands.recv() => match data {
                Some(data) => data,
                None => return,
            },
        };
        let written = tokio::select! {
            _ = control.stopped() => return,
            written = shell.write(&data) => written,
        };
        if let Err(e) = written {
            debug!(session_id = %control.session_id(), error = %e, "shell write failed");
            control.teardown("shell write failed").await;
            return;
        }
    }
}

/// Decode shell output into whole-character units.
///
/// Ends on end-of-stream or the first read error by dropping `units`; the
/// batching relay takes that as the end of the session. The output stream is
/// consumed and cannot be read again.
pub async fn output_reader(
    mut output: ShellOutput,
    units: mpsc::Sender<String>,
    control: Arc<SessionControl>,
) {
    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = control.stopped() => return,
            read = output.read(&mut buf) => read,
        };
        let unit = match read {
            Ok(0) => {
                debug!(session_id = %control.session_id(), "shell output ended");
                if let Some(tail) = decoder.finish() {
                    let _ = units.send(tail).await;
                }
                return;
            }
            Ok(n) => decoder.feed(&buf[..n]),
            Err(e) => {
                debug!(session_id = %control.session_id(), error = %e, "shell read failed");
                return;
            }
        };
        if unit.is_empty() {
            continue;
        }
        tokio::select! {
            _ = control.stopped() => return,
            sent = units.send(unit) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Accumulates output units between flushes.
#[derive(Debug, Default)]
pub struct OutputBatcher {
    buffer: String,
}

impl OutputBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: &str) {
        self.buffer.push_str(unit);
    }

    /// Everything pushed since the last flush, or `None` if nothing was.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Coalesce output units into at most one text frame per tick.
pub async fn batching_relay(
    mut units: mpsc::Receiver<String>,
    socket: Arc<BrowserSocket>,
    control: Arc<SessionControl>,
    flush_interval: Duration,
) {
    let mut batcher = OutputBatcher::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = control.stopped() => return,
            _ = ticker.tick() => {
                if let Some(frame) = batcher.flush() {
                    if !send_frame(&socket, &control, frame).await {
                        return;
                    }
                }
            }
            unit = units.recv() => match unit {
                Some(unit) => batcher.push(&unit),
                None => {
                    if let Some(frame) = batcher.flush() {
                        send_frame(&socket, &control, frame).await;
                    }
                    control.teardown("remote shell ended").await;
                    return;
                }
            },
        }
    }
}

/// Send one output frame; tears the session down if the browser is gone.
async fn send_frame(socket: &BrowserSocket, control: &SessionControl, frame: String) -> bool {
    trace!(session_id = %control.session_id(), len = frame.len(), "output frame");
    let sent = tokio::select! {
        _ = control.stopped() => return false,
        sent = socket.send_text(frame) => sent,
    };
    match sent {
        Ok(()) => true,
        Err(e) => {
            debug!(session_id = %control.session_id(), error = %e, "browser send failed");
            control.teardown("browser send failed").await;
            false
        }
    }
}

/// Ping the browser every `interval`; a ping not sent within `deadline`
/// ends the session.
pub async fn keepalive(
    socket: Arc<BrowserSocket>,
    control: Arc<SessionControl>,
    interval: Duration,
    deadline: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = control.stopped() => return,
            _ = ticker.tick() => {}
        }
        let pinged = tokio::select! {
            _ = control.stopped() => return,
            pinged = tokio::time::timeout(deadline, socket.ping()) => pinged,
        };
        match pinged {
            Ok(Ok(())) => trace!(session_id = %control.session_id(), "keepalive ping"),
            Ok(Err(e)) => {
                debug!(session_id = %control.session_id(), error = %e, "keepalive ping failed");
                control.teardown("keepalive failed").await;
                return;
            }
            Err(_) => {
                control.teardown("keepalive deadline exceeded").await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::lifecycle::SessionState;
    use crate::session::registry::SessionRegistry;
    use crate::session::test_support::{MockRemote, MockShell};
    use crate::transport::websocket::test_support::{socket_pair, ClientSocket};
    use futures_util::{SinkExt, StreamExt};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
    use tokio_tungstenite::tungstenite::Message;

    struct Live {
        control: Arc<SessionControl>,
        inbound: BrowserInbound,
        client: ClientSocket,
        remote: MockRemote,
        registry: Arc<SessionRegistry>,
    }

    async fn live_session() -> Live {
        let registry = Arc::new(SessionRegistry::new());
        let (socket, inbound, client) = socket_pair().await;
        let token = registry
            .insert("relay", "127.0.0.1:40000".parse().unwrap(), socket.clone())
            .await;
        let (shell, remote) = MockShell::pair();
        let control = Arc::new(SessionControl::new(
            "relay".into(),
            token,
            socket,
            Arc::new(shell),
            registry.clone(),
        ));
        control.activate();
        Live {
            control,
            inbound,
            client,
            remote,
            registry,
        }
    }

    async fn next_text(client: &mut ClientSocket) -> String {
        match client.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Occupy the browser sink with a frame larger than the pipe, so every
    /// later send waits behind it while the client does not read.
    fn jam_browser_sink(socket: Arc<BrowserSocket>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let _ = socket.send_text("x".repeat(256 * 1024)).await;
        })
    }

    /// Shell output that fails like a reset connection.
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )))
        }
    }

    #[test]
    fn batcher_concatenates_in_order_and_clears() {
        let mut batcher = OutputBatcher::new();
        assert!(batcher.flush().is_none());

        batcher.push("\x1b[1m");
        batcher.push("hé");
        batcher.push("llo");
        assert_eq!(batcher.flush().as_deref(), Some("\x1b[1mhéllo"));
        assert!(batcher.flush().is_none());

        batcher.push("!");
        assert_eq!(batcher.flush().as_deref(), Some("!"));
    }

    #[tokio::test(start_paused = true)]
    async fn units_between_ticks_become_one_frame() {
        let Live {
            control,
            mut client,
            ..
        } = live_session().await;
        let (tx, rx) = mpsc::channel(16);
        for unit in ["a", "b", "c"] {
            tx.send(unit.to_string()).await.unwrap();
        }

        let relay = tokio::spawn(batching_relay(
            rx,
            control.socket().clone(),
            control.clone(),
            Duration::from_millis(20),
        ));

        assert_eq!(next_text(&mut client).await, "abc");
        tx.send("d".into()).await.unwrap();
        tx.send("e".into()).await.unwrap();
        assert_eq!(next_text(&mut client).await, "de");

        // end of output flushes and tears down
        tx.send("f".into()).await.unwrap();
        drop(tx);
        assert_eq!(next_text(&mut client).await, "f");
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));
        relay.await.unwrap();
        assert_eq!(control.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn input_is_written_verbatim_and_in_order() {
        let Live {
            control,
            inbound,
            mut client,
            mut remote,
            ..
        } = live_session().await;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(browser_reader(inbound, tx, control.clone()));
        tokio::spawn(input_relay(rx, control.shell().clone(), control.clone()));

        client.send(Message::Text("ls\n".into())).await.unwrap();
        client.send(Message::Binary(b"pwd\n".to_vec().into())).await.unwrap();

        let mut got = vec![0u8; 7];
        remote.io.read_exact(&mut got).await.unwrap();
        assert_eq!(got, b"ls\npwd\n");
        control.teardown("test").await;
    }

    #[tokio::test]
    async fn shell_write_failure_tears_down() {
        let Live {
            control,
            mut client,
            remote,
            registry,
            ..
        } = live_session().await;
        let stats = remote.stats.clone();
        drop(remote.io);

        let (tx, rx) = mpsc::channel(4);
        let relay = tokio::spawn(input_relay(rx, control.shell().clone(), control.clone()));
        tx.send(b"ls\n".to_vec()).await.unwrap();

        relay.await.unwrap();
        assert_eq!(control.state(), SessionState::Closed);
        assert_eq!(stats.close_count(), 1);
        assert_eq!(registry.count().await, 0);
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));
    }

    #[tokio::test]
    async fn output_reader_keeps_characters_whole() {
        let Live { control, .. } = live_session().await;
        let (mut remote_io, shell_io) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(16);
        let reader = tokio::spawn(output_reader(Box::new(shell_io), tx, control.clone()));

        // "é" split across two writes
        remote_io.write_all(b"caf\xc3").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "caf");
        remote_io.write_all(b"\xa9!").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "é!");

        remote_io.shutdown().await.unwrap();
        assert!(rx.recv().await.is_none());
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn shell_read_error_ends_session() {
        let Live {
            control,
            mut client,
            remote,
            registry,
            ..
        } = live_session().await;
        let output: ShellOutput =
            Box::new(std::io::Cursor::new(b"last words".to_vec()).chain(ResetStream));
        let (tx, rx) = mpsc::channel(16);
        let reader = tokio::spawn(output_reader(output, tx, control.clone()));
        let relay = tokio::spawn(batching_relay(
            rx,
            control.socket().clone(),
            control.clone(),
            Duration::from_millis(5),
        ));

        assert_eq!(next_text(&mut client).await, "last words");
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));
        reader.await.unwrap();
        relay.await.unwrap();
        assert_eq!(control.state(), SessionState::Closed);
        assert_eq!(remote.stats.close_count(), 1);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn browser_close_tears_down_and_closes_shell() {
        let Live {
            control,
            inbound,
            mut client,
            remote,
            ..
        } = live_session().await;
        let (tx, _rx) = mpsc::channel(4);
        let reader = tokio::spawn(browser_reader(inbound, tx, control.clone()));

        client.close(None).await.unwrap();
        reader.await.unwrap();
        assert_eq!(control.state(), SessionState::Closed);
        assert_eq!(remote.stats.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_on_schedule() {
        let Live {
            control,
            mut client,
            ..
        } = live_session().await;
        tokio::spawn(keepalive(
            control.socket().clone(),
            control.clone(),
            Duration::from_secs(20),
            Duration::from_secs(25),
        ));

        let start = Instant::now();
        match client.next().await {
            Some(Ok(Message::Ping(_))) => {}
            other => panic!("expected ping, got {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_secs(20));
        control.teardown("test").await;
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_ping_failure_tears_down() {
        let Live {
            control,
            client,
            remote,
            registry,
            ..
        } = live_session().await;
        drop(client);

        let pinger = tokio::spawn(keepalive(
            control.socket().clone(),
            control.clone(),
            Duration::from_secs(20),
            Duration::from_secs(25),
        ));
        pinger.await.unwrap();
        assert_eq!(control.state(), SessionState::Closed);
        assert_eq!(remote.stats.close_count(), 1);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_missed_deadline_tears_down() {
        let Live {
            control,
            client: _client,
            remote,
            registry,
            ..
        } = live_session().await;
        let jam = jam_browser_sink(control.socket().clone());

        let start = Instant::now();
        let pinger = tokio::spawn(keepalive(
            control.socket().clone(),
            control.clone(),
            Duration::from_secs(20),
            Duration::from_secs(1),
        ));
        pinger.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(21));
        assert_eq!(control.state(), SessionState::Closed);
        assert_eq!(remote.stats.close_count(), 1);
        assert_eq!(registry.count().await, 0);
        jam.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_stops_while_a_ping_is_pending() {
        let Live {
            control,
            client: _client,
            ..
        } = live_session().await;
        let jam = jam_browser_sink(control.socket().clone());

        let pinger = tokio::spawn(keepalive(
            control.socket().clone(),
            control.clone(),
            Duration::from_secs(20),
            Duration::from_secs(3600),
        ));
        // the first ping is now queued behind the jammed sink
        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::spawn({
            let control = control.clone();
            async move { control.teardown("test").await }
        });

        tokio::time::timeout(Duration::from_secs(60), pinger)
            .await
            .expect("keepalive outlived the session")
            .unwrap();
        jam.abort();
    }

    #[tokio::test]
    async fn browser_send_failure_closes_shell() {
        let Live {
            control,
            client,
            remote,
            ..
        } = live_session().await;
        drop(client);

        let (tx, rx) = mpsc::channel(4);
        let relay = tokio::spawn(batching_relay(
            rx,
            control.socket().clone(),
            control.clone(),
            Duration::from_millis(5),
        ));
        tx.send("orphaned output".into()).await.unwrap();

        relay.await.unwrap();
        assert_eq!(control.state(), SessionState::Closed);
        assert_eq!(remote.stats.close_count(), 1);
    }
}
