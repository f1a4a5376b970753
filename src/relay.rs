//! Payment webhook relay: verifies checkout events and forwards credit
//! mints to the economy service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::http::{json_response, not_found, read_body, BodyError, HttpBody};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
const MINT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing Stripe-Signature header")]
    MissingSignature,
    #[error("malformed Stripe-Signature header")]
    MalformedSignature,
    #[error("no signature matches the payload")]
    SignatureMismatch,
    #[error("signature timestamp outside tolerance")]
    StaleSignature,
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Body(#[from] BodyError),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

#[derive(Debug, Error)]
pub enum MintError {
    #[error("economy request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("economy service answered {0}")]
    Rejected(u16),
    #[error("checkout metadata incomplete: {0}")]
    Incomplete(String),
}

/// Check a `t=<unix>,v1=<hex>[,v1=...]` header against `"<t>.<body>"`.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now_unix: i64,
    tolerance: Duration,
) -> Result<(), RelayError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        let (key, value) = part.trim().split_once('=').ok_or(RelayError::MalformedSignature)?;
        match key {
            "t" => timestamp = Some(value.parse().map_err(|_| RelayError::MalformedSignature)?),
            "v1" => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(RelayError::MalformedSignature)?;
    if candidates.is_empty() {
        return Err(RelayError::MalformedSignature);
    }
    if now_unix.abs_diff(timestamp) > tolerance.as_secs() {
        return Err(RelayError::StaleSignature);
    }

    let matched = candidates.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    });
    if matched {
        Ok(())
    } else {
        Err(RelayError::SignatureMismatch)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    pub user_id: String,
    pub amount: i64,
    pub source: String,
}

fn credits_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Metadata object of a completed checkout. `Ok(None)` for events that are
/// acknowledged but not acted on; a checkout without metadata is rejected.
pub fn checkout_metadata(event: &Value) -> Result<Option<&Value>, RelayError> {
    let kind = event
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::InvalidPayload("event has no type".into()))?;
    if kind != CHECKOUT_COMPLETED {
        return Ok(None);
    }
    event
        .pointer("/data/object/metadata")
        .filter(|m| m.is_object())
        .map(Some)
        .ok_or_else(|| RelayError::InvalidPayload("session has no metadata".into()))
}

/// Build the mint call from checkout metadata. Failures here are forwarding
/// failures: the webhook itself is still acknowledged.
pub fn mint_request(metadata: &Value) -> Result<MintRequest, MintError> {
    let user_id = metadata
        .get("userId")
        .and_then(Value::as_str)
        .ok_or_else(|| MintError::Incomplete("metadata.userId missing".into()))?;
    let tier = metadata.get("tier").and_then(Value::as_str).unwrap_or("unknown");
    let amount = metadata
        .get("credits")
        .and_then(credits_of)
        .ok_or_else(|| MintError::Incomplete("metadata.credits is not an integer".into()))?;

    Ok(MintRequest {
        user_id: user_id.to_string(),
        amount,
        source: format!("Stripe_{tier}"),
    })
}

#[derive(Clone)]
pub struct EconomyClient {
    client: reqwest::Client,
    base_url: String,
}

impl EconomyClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn mint(&self, request: &MintRequest) -> Result<(), MintError> {
        let url = format!("{}/api/mint_credits", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .json(request)
            .timeout(MINT_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(MintError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

pub struct RelayState {
    pub webhook_secret: Option<String>,
    pub tolerance: Duration,
    pub economy: EconomyClient,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn handle_webhook(state: &RelayState, req: Request<Incoming>) -> Result<(), RelayError> {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .map(|v| v.to_str().map(str::to_owned).map_err(|_| RelayError::MalformedSignature))
        .transpose()?;
    let body = read_body(req).await?;

    if let Some(secret) = state.webhook_secret.as_deref() {
        let header = signature.ok_or(RelayError::MissingSignature)?;
        verify_signature(secret, &header, &body, unix_now(), state.tolerance)?;
    }

    let event: Value =
        serde_json::from_slice(&body).map_err(|e| RelayError::InvalidPayload(e.to_string()))?;
    let Some(metadata) = checkout_metadata(&event)? else {
        return Ok(());
    };

    match forward(&state.economy, metadata).await {
        Ok(mint) => info!(user = %mint.user_id, "[RELAY] credits forwarded"),
        Err(e) => error!("[RELAY] credit forwarding failed: {}", e),
    }
    Ok(())
}

async fn forward(economy: &EconomyClient, metadata: &Value) -> Result<MintRequest, MintError> {
    let mint = mint_request(metadata)?;
    info!(
        user = %mint.user_id,
        amount = mint.amount,
        source = %mint.source,
        "[RELAY] payment confirmed"
    );
    economy.mint(&mint).await?;
    Ok(mint)
}

pub async fn handle_request(
    state: Arc<RelayState>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<HttpBody> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &json!({ "status": "active", "bridge": "stripe -> credit minting" }),
        ),
        (&Method::POST, "/webhook") => match handle_webhook(&state, req).await {
            Ok(()) => json_response(StatusCode::OK, &json!({ "success": true })),
            Err(e) => {
                warn!(%peer, "[RELAY] webhook rejected: {}", e);
                json_response(e.status_code(), &json!({ "error": e.to_string() }))
            }
        },
        _ => not_found(),
    }
}
