//! Live-view server: WebSocket subscriber sessions plus the small set of
//! plain HTTP routes (health, metrics, static dashboard files).

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::http::{self, bytes_response, json_response, not_found, text_response, HttpBody};
use crate::registry::{ConnectionRegistry, SendError, Subscriber};
use crate::telemetry::Telemetry;

const PLACEHOLDER_INDEX: &str =
    "<h1>OmniCore</h1><p>Public folder is empty. Check deployment logs.</p>";

/// Rejected subscriber handshakes. Existing subscribers are unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("expected a websocket upgrade request")]
    NotUpgrade,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("unsupported Sec-WebSocket-Version (only 13 is accepted)")]
    UnsupportedVersion,
}

fn header_has_token(headers: &HeaderMap, name: hyper::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    header_has_token(headers, UPGRADE, "websocket")
}

/// Validate the client handshake and derive the `Sec-WebSocket-Accept` value.
pub fn validate_handshake(headers: &HeaderMap) -> Result<String, HandshakeError> {
    if !is_upgrade_request(headers) || !header_has_token(headers, CONNECTION, "upgrade") {
        return Err(HandshakeError::NotUpgrade);
    }
    let version_ok = headers
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.trim() == "13");
    if !version_ok {
        return Err(HandshakeError::UnsupportedVersion);
    }
    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::MissingKey)?;
    Ok(derive_accept_key(key.as_bytes()))
}

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Outbound half of one WebSocket subscriber.
pub struct WsSubscriber<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    evicted: Notify,
}

impl<S> WsSubscriber<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            evicted: Notify::new(),
        }
    }

    /// Best-effort close frame; a peer that stopped reading gets `CLOSE_GRACE`.
    async fn hang_up(&self) {
        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            let _ = self.sink.lock().await.close().await;
        })
        .await;
    }
}

fn map_ws_error(e: tungstenite::Error) -> SendError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            SendError::Closed
        }
        other => SendError::Transport(other.to_string()),
    }
}

#[async_trait]
impl<S> Subscriber for WsSubscriber<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.to_string()))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&self) {
        self.evicted.notify_one();
    }
}

pub struct DashboardState {
    pub registry: Arc<ConnectionRegistry>,
    pub telemetry: Arc<Telemetry>,
    pub public_dir: PathBuf,
}

/// Register the socket, then read it only to notice the peer leaving.
/// Inbound frames are discarded; all outbound data comes from broadcasts.
/// The session also ends when the registry evicts it after a failed send.
pub async fn run_session<S>(
    registry: Arc<ConnectionRegistry>,
    telemetry: Arc<Telemetry>,
    ws: WebSocketStream<S>,
    peer: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut inbound) = ws.split();
    let subscriber = Arc::new(WsSubscriber::new(sink));
    let id = registry.register(subscriber.clone());
    telemetry.subscribers.set(registry.len() as i64);
    info!(%peer, subscriber = %id, total = registry.len(), "[TRANSPORT] subscriber connected");

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(%peer, subscriber = %id, "[TRANSPORT] read error: {}", e);
                    break;
                }
            },
            _ = subscriber.evicted.notified() => {
                info!(%peer, subscriber = %id, "[TRANSPORT] evicted by registry");
                break;
            }
        }
    }

    registry.unregister(id);
    telemetry.subscribers.set(registry.len() as i64);
    subscriber.hang_up().await;
    info!(%peer, subscriber = %id, total = registry.len(), "[TRANSPORT] subscriber disconnected");
}

fn accept_subscriber(
    state: Arc<DashboardState>,
    mut req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<HttpBody> {
    let accept = match validate_handshake(req.headers()) {
        Ok(accept) => accept,
        Err(e) => {
            warn!(%peer, "[TRANSPORT] handshake rejected: {}", e);
            return bytes_response(
                StatusCode::BAD_REQUEST,
                "text/plain; charset=utf-8",
                e.to_string(),
            );
        }
    };
    let accept = match HeaderValue::from_str(&accept) {
        Ok(v) => v,
        Err(_) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                run_session(state.registry.clone(), state.telemetry.clone(), ws, peer).await;
            }
            Err(e) => warn!(%peer, "[TRANSPORT] upgrade failed: {}", e),
        }
    });

    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = resp.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    resp
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Map a `/static/` suffix onto the public dir; `None` for anything that
/// could escape it.
pub fn resolve_static(public_dir: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut components = rel.components().peekable();
    components.peek()?;
    if !components.all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(public_dir.join(rel))
}

async fn serve_file(path: &Path) -> Option<Response<HttpBody>> {
    let bytes = tokio::fs::read(path).await.ok()?;
    Some(bytes_response(StatusCode::OK, content_type_for(path), bytes))
}

async fn serve_index(public_dir: &Path) -> Response<HttpBody> {
    match serve_file(&public_dir.join("index.html")).await {
        Some(resp) => resp,
        None => bytes_response(
            StatusCode::NOT_FOUND,
            "text/html; charset=utf-8",
            Bytes::from_static(PLACEHOLDER_INDEX.as_bytes()),
        ),
    }
}

pub async fn handle_request(
    state: Arc<DashboardState>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<HttpBody> {
    if req.method() != Method::GET {
        return not_found();
    }
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/" if is_upgrade_request(req.headers()) => accept_subscriber(state, req, peer),
        "/ws" => accept_subscriber(state, req, peer),
        "/" => serve_index(&state.public_dir).await,
        "/health" => json_response(
            StatusCode::OK,
            &json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }),
        ),
        "/metrics" => match state.telemetry.encode() {
            Ok(text) => bytes_response(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => {
                warn!("[TRANSPORT] metrics encoding failed: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        },
        other => match other.strip_prefix("/static/") {
            Some(rel) => match resolve_static(&state.public_dir, rel) {
                Some(file) => serve_file(&file).await.unwrap_or_else(not_found),
                None => not_found(),
            },
            None => not_found(),
        },
    }
}

pub async fn serve_dashboard(
    listener: TcpListener,
    state: Arc<DashboardState>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    http::serve(
        listener,
        move |req, peer| handle_request(state.clone(), req, peer),
        shutdown,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn handshake_derives_rfc6455_accept_key() {
        let h = headers(&[
            ("upgrade", "websocket"),
            ("connection", "keep-alive, Upgrade"),
            ("sec-websocket-version", "13"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);
        assert_eq!(
            validate_handshake(&h).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn malformed_handshakes_are_rejected() {
        let no_key = headers(&[
            ("upgrade", "websocket"),
            ("connection", "upgrade"),
            ("sec-websocket-version", "13"),
        ]);
        assert_eq!(validate_handshake(&no_key), Err(HandshakeError::MissingKey));

        let old_version = headers(&[
            ("upgrade", "websocket"),
            ("connection", "upgrade"),
            ("sec-websocket-version", "8"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);
        assert_eq!(validate_handshake(&old_version), Err(HandshakeError::UnsupportedVersion));

        let plain = headers(&[("connection", "keep-alive")]);
        assert_eq!(validate_handshake(&plain), Err(HandshakeError::NotUpgrade));
    }

    #[test]
    fn static_paths_cannot_escape_public_dir() {
        let root = Path::new("/srv/public");
        assert_eq!(
            resolve_static(root, "js/app.js"),
            Some(PathBuf::from("/srv/public/js/app.js"))
        );
        assert_eq!(resolve_static(root, "../secrets"), None);
        assert_eq!(resolve_static(root, "js/../../etc/passwd"), None);
        assert_eq!(resolve_static(root, "/etc/passwd"), None);
        assert_eq!(resolve_static(root, ""), None);
    }

    #[tokio::test]
    async fn session_registers_until_client_closes() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(500)));
        let telemetry = Arc::new(Telemetry::new().unwrap());
        let (server_io, client_io) = tokio::io::duplex(4096);

        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let session = tokio::spawn(run_session(
            registry.clone(),
            telemetry.clone(),
            server_ws,
            "127.0.0.1:1".parse().unwrap(),
        ));

        while registry.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(telemetry.subscribers.get(), 1);

        // Inbound chatter is ignored and never echoed.
        client.send(Message::Text("hello?".into())).await.unwrap();
        let report = registry.broadcast("{\"tick\":1}").await;
        assert_eq!(report.delivered, 1);
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text, "{\"tick\":1}"),
            other => panic!("unexpected frame {other:?}"),
        }

        client.close(None).await.unwrap();
        session.await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(telemetry.subscribers.get(), 0);
    }

    #[tokio::test]
    async fn evicted_session_hangs_up() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(50)));
        let telemetry = Arc::new(Telemetry::new().unwrap());
        let (server_io, client_io) = tokio::io::duplex(1024);

        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        // Never read from: the pipe fills up and sends stall.
        let _client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let session = tokio::spawn(run_session(
            registry.clone(),
            telemetry.clone(),
            server_ws,
            "127.0.0.1:2".parse().unwrap(),
        ));
        while registry.is_empty() {
            tokio::task::yield_now().await;
        }

        let big = "x".repeat(64 * 1024);
        let report = registry.broadcast(&big).await;
        assert_eq!(report.dropped.len(), 1);

        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session kept running after eviction")
            .unwrap();
        assert!(registry.is_empty());
        assert_eq!(telemetry.subscribers.get(), 0);
    }
}
