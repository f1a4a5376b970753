//! Chat-completion proxy in front of the DeepSeek API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::{json_response, not_found, read_json, BodyError, HttpBody};

pub const CHAT_MODEL: &str = "deepseek-chat";
pub const REASONER_MODEL: &str = "deepseek-reasoner";

const CHAT_PROMPT: &str =
    "You are QAntum, an advanced AI assistant. Part of the AETERNA system. Respond concisely.";
const ANALYZE_PROMPT: &str =
    "You are a deep reasoning AI. Analyze thoroughly and provide structured insights.";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub model: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    Chat,
    Analyze,
}

impl ProxyMode {
    pub fn model(self) -> &'static str {
        match self {
            ProxyMode::Chat => CHAT_MODEL,
            ProxyMode::Analyze => REASONER_MODEL,
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            ProxyMode::Chat => CHAT_PROMPT,
            ProxyMode::Analyze => ANALYZE_PROMPT,
        }
    }

    fn max_tokens(self) -> u32 {
        match self {
            ProxyMode::Chat => 1000,
            ProxyMode::Analyze => 2000,
        }
    }

    pub fn timeout(self) -> Duration {
        match self {
            ProxyMode::Chat => Duration::from_secs(30),
            ProxyMode::Analyze => Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    BadRequest(#[from] BodyError),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("upstream answered {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("unexpected upstream response: {0}")]
    Shape(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Request body for `/v1/chat/completions`.
pub fn completion_body(mode: ProxyMode, request: &ChatRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": mode.system_prompt() })];
    if !request.context.trim().is_empty() {
        messages.push(json!({ "role": "system", "content": request.context }));
    }
    messages.push(json!({ "role": "user", "content": request.message }));

    let mut body = json!({
        "model": mode.model(),
        "messages": messages,
        "max_tokens": mode.max_tokens(),
    });
    if mode == ProxyMode::Chat {
        body["temperature"] = json!(0.7);
    }
    body
}

pub fn parse_completion(value: &Value) -> Result<String, ProxyError> {
    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ProxyError::Shape("missing choices[0].message.content".into()))
}

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl LlmClient {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    pub async fn complete(
        &self,
        mode: ProxyMode,
        request: &ChatRequest,
    ) -> Result<String, ProxyError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&completion_body(mode, request))
            .timeout(mode.timeout())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let status = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::UpstreamStatus { status, body });
        }
        let value: Value = resp.json().await?;
        debug!(model = mode.model(), "[PROXY] completion received");
        parse_completion(&value)
    }
}

async fn answer(
    client: &LlmClient,
    mode: ProxyMode,
    req: Request<Incoming>,
) -> Result<Value, ProxyError> {
    let request: ChatRequest = read_json(req).await?;
    let text = client.complete(mode, &request).await?;
    let body = match mode {
        ProxyMode::Chat => {
            let response = ChatResponse {
                response: text,
                model: CHAT_MODEL,
            };
            serde_json::to_value(response).map_err(|e| ProxyError::Shape(e.to_string()))?
        }
        ProxyMode::Analyze => json!({ "analysis": text }),
    };
    Ok(body)
}

pub async fn handle_request(
    client: Arc<LlmClient>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<HttpBody> {
    let mode = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            return json_response(
                StatusCode::OK,
                &json!({ "status": "healthy", "engine": "ai-proxy" }),
            )
        }
        (&Method::POST, "/chat") => ProxyMode::Chat,
        (&Method::POST, "/analyze") => ProxyMode::Analyze,
        _ => return not_found(),
    };
    match answer(&client, mode, req).await {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(e) => {
            warn!(%peer, model = mode.model(), "[PROXY] request failed: {}", e);
            json_response(e.status_code(), &json!({ "detail": e.to_string() }))
        }
    }
}
