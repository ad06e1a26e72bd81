use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{DifyError, DifyErrorCode};
use crate::request::OutboundRequest;

const CHAT_MESSAGES_PATH: &str = "chat-messages";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockingUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockingMetadata {
    #[serde(default)]
    pub usage: Option<BlockingUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Success body of a blocking `chat-messages` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub answer: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<BlockingMetadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `{code, message, detail?}` as returned with non-2xx statuses. Dify sends
/// `code` as a string; older deployments used numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: Value,
    pub message: String,
    #[serde(default)]
    pub detail: Option<Map<String, Value>>,
}

/// Raw body bytes of a streaming response, pulled one network chunk at a time.
#[async_trait]
pub trait ChunkSource: Send {
    /// `Ok(None)` once the body is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DifyError>;
}

pub type BoxChunkSource = Box<dyn ChunkSource>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_blocking(
        &self,
        request: &OutboundRequest,
        headers: &HashMap<String, String>,
    ) -> Result<BlockingResponse, DifyError>;

    async fn open_stream(
        &self,
        request: &OutboundRequest,
        headers: &HashMap<String, String>,
    ) -> Result<BoxChunkSource, DifyError>;
}

pub type ChatTransportRef = Arc<dyn ChatTransport>;

/// `reqwest` transport against `{base_url}/chat-messages`.
pub struct HttpTransport {
    endpoint: String,
    headers: HashMap<String, String>,
    client: &'static Client,
}

impl HttpTransport {
    /// `headers` are sent with every call; per-call headers are applied after them.
    pub fn new(base_url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            endpoint: join_url(base_url, CHAT_MESSAGES_PATH),
            headers,
            client: shared_http_client(base_url),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(
        &self,
        request: &OutboundRequest,
        headers: &HashMap<String, String>,
        accept_event_stream: bool,
    ) -> Result<Response, DifyError> {
        let mut merged = HeaderMap::new();
        merged.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if accept_event_stream {
            merged.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        merge_headers(&mut merged, &self.headers)?;
        merge_headers(&mut merged, headers)?;

        let builder = self
            .client
            .post(self.endpoint.as_str())
            .headers(merged)
            .json(request);
        let response = builder.send().await.map_err(|error| {
            DifyError::transport(format!("Dify transport failed: {error}"))
        })?;
        ensure_success(response).await
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send_blocking(
        &self,
        request: &OutboundRequest,
        headers: &HashMap<String, String>,
    ) -> Result<BlockingResponse, DifyError> {
        let response = self.post(request, headers, false).await?;
        let body = response.text().await.map_err(|error| {
            DifyError::transport(format!("Dify response read failed: {error}"))
        })?;
        debug!(bytes = body.len(), "received blocking chat-messages response");
        parse_blocking_response(&body)
    }

    async fn open_stream(
        &self,
        request: &OutboundRequest,
        headers: &HashMap<String, String>,
    ) -> Result<BoxChunkSource, DifyError> {
        let response = self.post(request, headers, true).await?;
        Ok(Box::new(HttpChunkSource { response }))
    }
}

struct HttpChunkSource {
    response: Response,
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DifyError> {
        self.response
            .chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|error| DifyError::transport(format!("Dify stream read failed: {error}")))
    }
}

async fn ensure_success(response: Response) -> Result<Response, DifyError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read error body".to_string());
    Err(remote_error(status, &body))
}

/// Later layers replace earlier values; names compare case-insensitively.
pub(crate) fn merge_headers(
    merged: &mut HeaderMap,
    layer: &HashMap<String, String>,
) -> Result<(), DifyError> {
    for (name, value) in layer {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|error| {
            DifyError::protocol(format!("Invalid header name `{name}`: {error}"))
        })?;
        let header_value = HeaderValue::from_str(value.trim()).map_err(|error| {
            DifyError::protocol(format!("Invalid value for header `{name}`: {error}"))
        })?;
        merged.insert(header_name, header_value);
    }
    Ok(())
}

pub fn parse_blocking_response(body: &str) -> Result<BlockingResponse, DifyError> {
    serde_json::from_str(body).map_err(|error| {
        DifyError::decode(format!("Invalid Dify chat-messages response: {error}"))
            .with_details(json!({ "bodyPrefix": truncate_for_details(body, 800) }))
    })
}

pub fn remote_error(status: u16, body: &str) -> DifyError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => DifyError::new(
            DifyErrorCode::Remote,
            format!("Dify API error: {}", envelope.message),
        )
        .with_http_status(status)
        .with_details(json!({
            "code": envelope.code,
            "detail": envelope.detail,
        })),
        Err(_) => DifyError::new(
            DifyErrorCode::Remote,
            format!("Dify HTTP {status}: {}", truncate_for_details(body, 800)),
        )
        .with_http_status(status),
    }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

pub(crate) fn shared_http_client(base_url: &str) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_base_url(base_url) {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

pub(crate) fn is_loopback_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "[::1]"
}

fn truncate_for_details(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}
