//! [`FacadeServer`] – HTTP + WebSocket server for the Pico console.
//!
//! Listens on `0.0.0.0:5000` (configurable via [`FacadeServer::with_port`]).
//!
//! * WebSocket upgrades on `/ws/logs` → live tail of the log aggregator.
//! * Everything else → one HTTP/1.1 request per connection, answered by
//!   [`route`] and closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use picolink_types::BridgeError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::api::{FacadeContext, HttpResponse, route};

/// Default TCP port for the façade.
pub const DEFAULT_PORT: u16 = 5000;

/// Path of the live log WebSocket.
pub const LOG_STREAM_PATH: &str = "/ws/logs";

/// Largest request head accepted.
const MAX_HEAD_BYTES: usize = 16 * 1024;
/// Largest request body accepted.
const MAX_BODY_BYTES: usize = 64 * 1024;
/// Time a client gets to send its full request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between peeks while a request head is still arriving.
const HEAD_POLL: Duration = Duration::from_millis(10);

pub struct FacadeServer {
    ctx: Arc<FacadeContext>,
    port: u16,
}

impl FacadeServer {
    /// Create a server on the [`DEFAULT_PORT`].
    pub fn new(ctx: Arc<FacadeContext>) -> Self {
        Self {
            ctx,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:<port>` and serve until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Server`] if the TCP listener cannot bind.
    pub async fn run(self) -> Result<(), BridgeError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Server(format!("bind error on {addr}: {e}")))?;

        info!(url = %format!("http://localhost:{}", self.port), "web console listening");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), BridgeError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, ctx).await {
                            warn!(peer = %peer, error = %e, "client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<FacadeContext>,
) -> Result<(), BridgeError> {
    let preview = tokio::time::timeout(HEAD_TIMEOUT, peek_head(&stream, peer))
        .await
        .map_err(|_| BridgeError::Server(format!("request head from {peer} timed out")))??;

    if is_websocket_upgrade(&preview) && request_path(&preview) == Some(LOG_STREAM_PATH) {
        return stream_logs(stream, peer, ctx).await;
    }

    let response = match read_request(&mut stream).await {
        Ok(request) => {
            debug!(peer = %peer, method = %request.method, path = %request.path, "request");
            route(&request.method, &request.path, &request.body, &ctx)
        }
        Err(response) => response,
    };

    stream
        .write_all(&response.to_bytes())
        .await
        .map_err(|e| BridgeError::Server(format!("write error to {peer}: {e}")))?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Peek until the whole request head is buffered, or [`MAX_HEAD_BYTES`] of
/// it.  `peek` leaves the bytes in place so the WebSocket handshake and
/// [`read_request`] still see the full request.
async fn peek_head(stream: &TcpStream, peer: SocketAddr) -> Result<String, BridgeError> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let mut seen = 0;
    loop {
        let n = stream
            .peek(&mut buf)
            .await
            .map_err(|e| BridgeError::Server(format!("peek error from {peer}: {e}")))?;
        if n == 0 || n == buf.len() || find_head_end(&buf[..n]).is_some() {
            return Ok(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        // Peek returns at once while unread bytes are pending.
        if n == seen {
            tokio::time::sleep(HEAD_POLL).await;
        }
        seen = n;
    }
}

fn is_websocket_upgrade(preview: &str) -> bool {
    preview.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

fn request_path(preview: &str) -> Option<&str> {
    let path = preview.lines().next()?.split_whitespace().nth(1)?;
    Some(path.split_once('?').map_or(path, |(p, _)| p))
}

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    content_length: usize,
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn parse_head(head: &str) -> Result<RequestHead, HttpResponse> {
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or("").split_whitespace();
    let (Some(method), Some(path)) = (request_line.next(), request_line.next()) else {
        return Err(HttpResponse::error(400, "malformed request line"));
    };

    let mut content_length = 0;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| HttpResponse::error(400, "invalid content-length"))?;
        } else if name.trim().eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            return Err(HttpResponse::error(411, "chunked request bodies are not supported"));
        }
    }

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        content_length,
    })
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_request(stream: &mut TcpStream) -> Result<Request, HttpResponse> {
    let mut data = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(end) = find_head_end(&data) {
            break end;
        }
        if data.len() > MAX_HEAD_BYTES {
            return Err(HttpResponse::error(400, "request head too large"));
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return Err(HttpResponse::error(400, "incomplete request")),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
        }
    };

    let head = parse_head(&String::from_utf8_lossy(&data[..head_end]))?;
    if head.content_length > MAX_BODY_BYTES {
        return Err(HttpResponse::error(413, "request body too large"));
    }

    let mut body = data.split_off(head_end + 4);
    while body.len() < head.content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return Err(HttpResponse::error(400, "incomplete body")),
            Ok(n) => body.extend_from_slice(&chunk[..n]),
        }
    }
    body.truncate(head.content_length);

    Ok(Request {
        method: head.method,
        path: head.path,
        body,
    })
}

async fn stream_logs(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<FacadeContext>,
) -> Result<(), BridgeError> {
    // Subscribe before the handshake completes so no line appended after the
    // client sees the upgrade is missed.
    let mut tail = ctx.aggregator.subscribe_tail();
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| BridgeError::Server(format!("ws handshake from {peer}: {e}")))?;
    debug!(peer = %peer, "log stream client connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            line = tail.recv() => {
                match line {
                    Ok(line) => {
                        if ws_tx.send(Message::Text(line.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(peer = %peer, lagged_by = n, "log stream client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    debug!(peer = %peer, "log stream client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::LogAggregator;
    use picolink_middleware::{BusClient, LocalBus};
    use picolink_types::{BusMessage, CommandEncoder};
    use tokio::sync::mpsc;

    fn make_ctx(bus: Arc<dyn BusClient>) -> Arc<FacadeContext> {
        Arc::new(FacadeContext::new(
            Arc::new(LogAggregator::new(50)),
            bus,
            CommandEncoder::default(),
            "pico/cmd",
        ))
    }

    async fn spawn_server(ctx: Arc<FacadeContext>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(FacadeServer::new(ctx).serve(listener));
        addr
    }

    async fn exchange(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
            .await
            .expect("response timed out")
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    fn post(path: &str, body: &str) -> String {
        format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn default_port_is_5000() {
        let server = FacadeServer::new(make_ctx(Arc::new(LocalBus::default())));
        assert_eq!(server.port(), DEFAULT_PORT);
        assert_eq!(server.with_port(8081).port(), 8081);
    }

    #[test]
    fn head_parsing() {
        let head = parse_head("POST /api/send HTTP/1.1\r\nHost: x\r\ncontent-length: 12").unwrap();
        assert_eq!(
            head,
            RequestHead {
                method: "POST".to_string(),
                path: "/api/send".to_string(),
                content_length: 12,
            }
        );
        assert_eq!(parse_head("GARBAGE").unwrap_err().status, 400);
        assert_eq!(
            parse_head("POST / HTTP/1.1\r\nContent-Length: lots").unwrap_err().status,
            400
        );
        assert_eq!(
            parse_head("POST / HTTP/1.1\r\nTransfer-Encoding: gzip, Chunked").unwrap_err().status,
            411
        );
    }

    #[test]
    fn websocket_detection() {
        let upgrade = "GET /ws/logs?x=1 HTTP/1.1\r\nHost: a\r\nUpgrade: WebSocket\r\n\r\n";
        assert!(is_websocket_upgrade(upgrade));
        assert_eq!(request_path(upgrade), Some("/ws/logs"));
        assert!(!is_websocket_upgrade("GET / HTTP/1.1\r\nHost: a\r\n\r\n"));
    }

    #[tokio::test]
    async fn serves_index_and_logs() {
        let ctx = make_ctx(Arc::new(LocalBus::default()));
        ctx.aggregator.append("=== MAIN MENU ===\n");
        let addr = spawn_server(ctx).await;

        let index = exchange(addr, "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(index.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(index.contains("text/html"));

        let logs = exchange(addr, "GET /api/logs HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(logs.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(logs.ends_with(r#"{"db_loading":false,"lines":["=== MAIN MENU ===\n"]}"#));
    }

    #[tokio::test]
    async fn command_is_published_to_bus() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Arc::new(LocalBus::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "pico/cmd",
            Arc::new(move |msg: BusMessage| {
                let _ = tx.send(msg.text().into_owned());
            }),
        )?;
        let addr = spawn_server(make_ctx(bus)).await;

        let resp = exchange(addr, &post("/api/command", r#"{"action":"backup"}"#)).await;
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.ends_with(r#"{"ok":true}"#));

        let resp = exchange(
            addr,
            &post("/api/command", r#"{"action":"identify","topN":"12"}"#),
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));

        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.as_deref(),
            Some("2")
        );
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.as_deref(),
            Some("110\n")
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let addr = spawn_server(make_ctx(Arc::new(LocalBus::default()))).await;

        let resp = exchange(addr, &post("/api/send", r#"{"data":""}"#)).await;
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        let resp = exchange(addr, "GET /missing HTTP/1.1\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let resp = exchange(addr, "PUT /api/logs HTTP/1.1\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));

        let resp = exchange(
            addr,
            "POST /api/send HTTP/1.1\r\nContent-Length: 10000000\r\n\r\n",
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn chunked_body_is_refused_with_reason() {
        let bus = Arc::new(LocalBus::default());
        let published = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = published.clone();
        bus.subscribe(
            "pico/cmd",
            Arc::new(move |_: BusMessage| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        )
        .unwrap();
        let addr = spawn_server(make_ctx(bus)).await;

        let resp = exchange(
            addr,
            "POST /api/send HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 411 Length Required\r\n"));
        assert!(resp.contains("chunked request bodies are not supported"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(published.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn split_request_head_still_upgrades() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = make_ctx(Arc::new(LocalBus::default()));
        let addr = spawn_server(ctx.clone()).await;

        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"GET /ws/logs HTTP/1.1\r\nHost: localhost\r\n").await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        stream
            .write_all(
                b"Upgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await?;

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(2), async {
            while find_head_end(&head).is_none() {
                if stream.read(&mut byte).await? == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            Ok::<_, std::io::Error>(())
        })
        .await??;
        let head = String::from_utf8(head)?;
        assert!(head.starts_with("HTTP/1.1 101"), "got {head:?}");
        assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        Ok(())
    }

    #[tokio::test]
    async fn websocket_streams_new_lines() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = make_ctx(Arc::new(LocalBus::default()));
        let addr = spawn_server(ctx.clone()).await;

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}{LOG_STREAM_PATH}")).await?;
        ctx.aggregator.append("Backup complete\n");

        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await?
            .ok_or("stream ended")??;
        assert_eq!(msg.to_text()?, "Backup complete\n");
        Ok(())
    }
}
