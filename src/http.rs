//! Small hyper helpers shared by the three services: response builders, body
//! reading, and the http1 accept loop.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type HttpBody = Full<Bytes>;

/// Request bodies above this are rejected before parsing.
pub const MAX_BODY_BYTES: usize = 1 << 20;

pub fn bytes_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<HttpBody> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

pub fn text_response(status: StatusCode, body: &'static str) -> Response<HttpBody> {
    bytes_response(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<HttpBody> {
    match serde_json::to_vec(value) {
        Ok(body) => bytes_response(status, "application/json", body),
        Err(e) => {
            warn!("[HTTP] response serialization failed: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub fn not_found() -> Response<HttpBody> {
    text_response(StatusCode::NOT_FOUND, "not found")
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("request body unreadable or too large: {0}")]
    Read(String),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub async fn read_body(req: Request<Incoming>) -> Result<Bytes, BodyError> {
    Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| BodyError::Read(e.to_string()))
}

pub async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, BodyError> {
    let body = read_body(req).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Accept connections on `listener` until `shutdown` flips to `true`,
/// serving each one with `handler` on its own task. Upgrades are enabled so
/// handlers can hand connections over to WebSocket sessions.
pub async fn serve<H, F>(
    listener: TcpListener,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    H: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Response<HttpBody>> + Send + 'static,
{
    info!("[HTTP] listening on http://{}", listener.local_addr()?);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[HTTP] accept failed: {}", e);
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("[HTTP] listener shutting down");
                    return Ok(());
                }
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req, peer).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!(%peer, "[HTTP] connection error: {:?}", e);
            }
        });
    }
}
