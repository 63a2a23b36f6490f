//! WebSocket listener using tokio-tungstenite.
//!
//! The upgrade is accepted only for `{prefix}/{sessionId}` with a non-empty
//! id; anything else is answered with a JSON error before any session state
//! exists. Accepted sockets are split into a shared, idempotently closable
//! send half (`BrowserSocket`) and a receive half (`BrowserInbound`).

use crate::session::registry::SessionRegistry;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::CONTENT_TYPE;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use webssh_core::{WebSshError, WebSshResult};

/// Maximum accepted size of one inbound frame (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// How long `close` may wait for a concurrent send to release the socket.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// An accepted, upgraded browser connection.
pub struct WebSocketConnection {
    /// The upgraded stream.
    pub ws_stream: WebSocketStream<TcpStream>,
    /// Remote address.
    pub remote_addr: SocketAddr,
    /// Session identifier taken from the request path.
    pub session_id: String,
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Path matched the endpoint but carried no session id.
    EmptySessionId,
    /// Path is not the terminal endpoint.
    NotFound,
    /// The session cap is reached.
    AtCapacity,
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Rejection::EmptySessionId => StatusCode::FORBIDDEN,
            Rejection::NotFound => StatusCode::NOT_FOUND,
            Rejection::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Rejection::EmptySessionId => "session id is null",
            Rejection::NotFound => "not found",
            Rejection::AtCapacity => "too many sessions",
        }
    }

    /// HTTP response sent instead of the upgrade.
    fn to_response(self) -> ErrorResponse {
        let body = serde_json::json!({
            "errorCode": self.status().as_u16(),
            "result": null,
            "message": self.message(),
        })
        .to_string();
        let mut resp = ErrorResponse::new(Some(body));
        *resp.status_mut() = self.status();
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }
}

/// Extract the session id from an upgrade request path.
pub fn parse_session_path(prefix: &str, path: &str) -> Result<String, Rejection> {
    let rest = path.strip_prefix(prefix).ok_or(Rejection::NotFound)?;
    if rest.is_empty() || rest == "/" {
        return Err(Rejection::EmptySessionId);
    }
    let id = rest.strip_prefix('/').ok_or(Rejection::NotFound)?;
    if id.contains('/') {
        return Err(Rejection::NotFound);
    }
    Ok(id.to_string())
}

/// Admission rules checked during the HTTP upgrade.
pub struct UpgradeGate {
    pub path_prefix: String,
    pub max_sessions: usize,
    pub registry: Arc<SessionRegistry>,
}

/// Start accepting WebSocket upgrades on an already bound listener.
///
/// Returns a receiver that yields accepted connections. The accept loop ends
/// once the receiver is dropped.
pub fn start_listener(
    tcp_listener: TcpListener,
    gate: Arc<UpgradeGate>,
) -> mpsc::Receiver<WebSocketConnection> {
    if let Ok(addr) = tcp_listener.local_addr() {
        info!(addr = %addr, prefix = %gate.path_prefix, "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let gate = gate.clone();
                    tokio::spawn(async move {
                        if let Some(conn) = upgrade(stream, addr, &gate).await {
                            if tx.send(conn).await.is_err() {
                                warn!("WebSocket connection channel closed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    rx
}

/// Perform the HTTP upgrade, refusing requests the gate does not admit.
async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    gate: &UpgradeGate,
) -> Option<WebSocketConnection> {
    let full = gate.registry.count().await >= gate.max_sessions;
    let mut session_id: Option<String> = None;

    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if full {
            return Err(Rejection::AtCapacity.to_response());
        }
        match parse_session_path(&gate.path_prefix, req.uri().path()) {
            Ok(id) => {
                session_id = Some(id);
                Ok(resp)
            }
            Err(rejection) => Err(rejection.to_response()),
        }
    };

    match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => {
            let session_id = session_id?;
            debug!(remote = %addr, session_id = %session_id, "WebSocket connection accepted");
            Some(WebSocketConnection {
                ws_stream,
                remote_addr: addr,
                session_id,
            })
        }
        Err(WsError::Http(resp)) => {
            warn!(remote = %addr, status = %resp.status(), "WebSocket upgrade rejected");
            None
        }
        Err(e) => {
            warn!(remote = %addr, error = %e, "WebSocket handshake failed");
            None
        }
    }
}

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Send half of a browser connection, shared by the session's activities.
pub struct BrowserSocket {
    sink: Mutex<WsSink>,
    closed: AtomicBool,
}

impl BrowserSocket {
    /// Split an upgraded stream into the shared send half and the receive half.
    pub fn split<S>(ws: WebSocketStream<S>) -> (Arc<BrowserSocket>, BrowserInbound)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let socket = Arc::new(BrowserSocket {
            sink: Mutex::new(Box::pin(sink)),
            closed: AtomicBool::new(false),
        });
        let inbound = BrowserInbound {
            stream: Box::pin(stream),
        };
        (socket, inbound)
    }

    /// Send one text frame.
    pub async fn send_text(&self, text: String) -> WebSshResult<()> {
        self.send(Message::Text(text.into())).await
    }

    /// Send a protocol-level ping.
    pub async fn ping(&self) -> WebSshResult<()> {
        self.send(Message::Ping(Vec::new().into())).await
    }

    async fn send(&self, msg: Message) -> WebSshResult<()> {
        if self.is_closed() {
            return Err(WebSshError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(msg)
            .await
            .map_err(|e| WebSshError::Transport(format!("WS send failed: {e}")))
    }

    /// Send a close frame and shut the sink. Only the first call does anything.
    pub async fn close(&self, code: CloseCode, reason: &str) -> WebSshResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };

        let closing = async {
            let mut sink = self.sink.lock().await;
            // the peer may already be gone; shut the sink regardless
            let _ = sink.send(Message::Close(Some(frame))).await;
            sink.close().await
        };

        match tokio::time::timeout(CLOSE_GRACE, closing).await {
            Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) | Ok(Err(WsError::AlreadyClosed)) => {
                Ok(())
            }
            Ok(Err(e)) => Err(WebSshError::Transport(format!("WS close failed: {e}"))),
            Err(_) => Err(WebSshError::Timeout),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Receive half of a browser connection, owned by the browser reader.
pub struct BrowserInbound {
    stream: WsStream,
}

impl BrowserInbound {
    /// Next application payload (text or binary frame).
    ///
    /// Returns `None` once the peer closes. Control frames are skipped; pings
    /// are answered by the protocol layer.
    pub async fn next_payload(&mut self) -> WebSshResult<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    check_frame_size(text.len())?;
                    return Ok(Some(text.into()));
                }
                Some(Ok(Message::Binary(data))) => {
                    check_frame_size(data.len())?;
                    return Ok(Some(data.into()));
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => {
                    return Err(WebSshError::Transport(format!("WS recv failed: {e}")));
                }
                None => return Ok(None),
            }
        }
    }
}

fn check_frame_size(len: usize) -> WebSshResult<()> {
    if len > MAX_WS_FRAME_SIZE {
        return Err(WebSshError::Transport(format!(
            "WS frame too large: {len} bytes (max {MAX_WS_FRAME_SIZE})"
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::socket_pair;
    use super::*;

    #[test]
    fn session_path_parsing() {
        let p = "/webssh/ws";
        assert_eq!(parse_session_path(p, "/webssh/ws/abc123"), Ok("abc123".into()));
        assert_eq!(parse_session_path(p, "/webssh/ws/"), Err(Rejection::EmptySessionId));
        assert_eq!(parse_session_path(p, "/webssh/ws"), Err(Rejection::EmptySessionId));
        assert_eq!(parse_session_path(p, "/webssh/wsx/abc"), Err(Rejection::NotFound));
        assert_eq!(parse_session_path(p, "/webssh/ws/a/b"), Err(Rejection::NotFound));
        assert_eq!(parse_session_path(p, "/other/abc"), Err(Rejection::NotFound));
    }

    #[test]
    fn rejection_body_matches_api_error_shape() {
        let resp = Rejection::EmptySessionId.to_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value =
            serde_json::from_str(resp.body().as_deref().unwrap()).unwrap();
        assert_eq!(body["errorCode"], 403);
        assert_eq!(body["message"], "session id is null");
        assert!(body["result"].is_null());
    }

    #[tokio::test]
    async fn text_and_ping_reach_the_browser() {
        let (socket, _inbound, mut client) = socket_pair().await;
        socket.send_text("hello".into()).await.unwrap();
        socket.ping().await.unwrap();

        match client.next().await {
            Some(Ok(Message::Text(t))) => assert_eq!(t.as_str(), "hello"),
            other => panic!("expected text frame, got {other:?}"),
        }
        match client.next().await {
            Some(Ok(Message::Ping(_))) => {}
            other => panic!("expected ping frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_yields_text_and_binary_payloads() {
        let (_socket, mut inbound, mut client) = socket_pair().await;
        client.send(Message::Text("ls\n".into())).await.unwrap();
        client.send(Message::Binary(b"\x03".to_vec().into())).await.unwrap();
        client.close(None).await.unwrap();

        assert_eq!(inbound.next_payload().await.unwrap(), Some(b"ls\n".to_vec()));
        assert_eq!(inbound.next_payload().await.unwrap(), Some(vec![3u8]));
        assert_eq!(inbound.next_payload().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_later_sends() {
        let (socket, _inbound, mut client) = socket_pair().await;
        socket.close(CloseCode::Normal, "bye").await.unwrap();
        socket.close(CloseCode::Normal, "again").await.unwrap();
        assert!(socket.is_closed());
        assert!(matches!(
            socket.send_text("late".into()).await,
            Err(WebSshError::Closed)
        ));

        match client.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
