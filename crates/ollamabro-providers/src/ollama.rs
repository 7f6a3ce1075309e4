use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use ollamabro_types::{strip_internal_flags, ChatRequest};

use crate::error::ProviderError;
use crate::relay::{relay_ollama, RelayOptions, RelayStream};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_USER_AGENT: &str = "OllamaBroProxy/1.0";
pub const OLLAMA_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const OLLAMA_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The Ollama endpoints callers may reach through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OllamaRoute {
    Tags,
    Chat,
    Generate,
    Show,
    Pull,
    Delete,
}

impl OllamaRoute {
    pub const ALL: [OllamaRoute; 6] = [
        OllamaRoute::Tags,
        OllamaRoute::Chat,
        OllamaRoute::Generate,
        OllamaRoute::Show,
        OllamaRoute::Pull,
        OllamaRoute::Delete,
    ];

    pub fn path(self) -> &'static str {
        match self {
            OllamaRoute::Tags => "api/tags",
            OllamaRoute::Chat => "api/chat",
            OllamaRoute::Generate => "api/generate",
            OllamaRoute::Show => "api/show",
            OllamaRoute::Pull => "api/pull",
            OllamaRoute::Delete => "api/delete",
        }
    }

    /// Exact match against the allow-list; `api/create` and friends fail.
    pub fn resolve(path: &str) -> Result<Self, ProviderError> {
        let normalized = path.trim_matches('/');
        Self::ALL
            .into_iter()
            .find(|route| route.path() == normalized)
            .ok_or_else(|| ProviderError::PathNotAllowed(format!("/{normalized}")))
    }

    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            OllamaRoute::Chat | OllamaRoute::Generate | OllamaRoute::Pull
        )
    }
}

/// Request body on its way to Ollama.
#[derive(Debug, Clone)]
pub enum OllamaPayload {
    Chat(Box<ChatRequest>),
    Json(Value),
    Raw(Vec<u8>),
    Empty,
}

impl OllamaPayload {
    /// Classifies a caller body. Chat bodies are parsed whatever their
    /// content type says, so a missing header cannot skip the forced
    /// `stream:true` or let the internal flags through. Chat bodies that do
    /// not fit `ChatRequest` still get flags stripped and streaming forced
    /// when they are JSON objects; anything unparseable is forwarded as-is.
    pub fn from_body(route: OllamaRoute, body: Vec<u8>) -> Self {
        if body.is_empty() {
            return OllamaPayload::Empty;
        }
        if route != OllamaRoute::Chat {
            return OllamaPayload::Raw(body);
        }
        match serde_json::from_slice::<ChatRequest>(&body) {
            Ok(mut chat) => {
                chat.force_stream();
                OllamaPayload::Chat(Box::new(chat))
            }
            Err(err) => match serde_json::from_slice::<Value>(&body) {
                Ok(mut value) if value.is_object() => {
                    tracing::warn!(error = %err, "chat body did not match the chat schema, forwarding loosely");
                    strip_internal_flags(&mut value);
                    value["stream"] = Value::Bool(true);
                    OllamaPayload::Json(value)
                }
                _ => {
                    tracing::warn!(error = %err, "chat body is not JSON, forwarding raw body");
                    OllamaPayload::Raw(body)
                }
            },
        }
    }

    pub fn chat_mut(&mut self) -> Option<&mut ChatRequest> {
        match self {
            OllamaPayload::Chat(chat) => Some(chat.as_mut()),
            _ => None,
        }
    }

    fn into_bytes(self) -> Result<Option<Vec<u8>>, ProviderError> {
        let bytes = match self {
            OllamaPayload::Chat(chat) => serde_json::to_vec(&chat)
                .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?,
            OllamaPayload::Json(value) => serde_json::to_vec(&value)
                .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?,
            OllamaPayload::Raw(bytes) => bytes,
            OllamaPayload::Empty => return Ok(None),
        };
        Ok(Some(bytes))
    }
}

#[derive(Debug, Clone)]
pub struct OllamaForward {
    pub route: OllamaRoute,
    pub method: Method,
    pub payload: OllamaPayload,
    pub content_type: Option<String>,
    pub accept: Option<String>,
    pub user_agent: Option<String>,
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: RelayStream,
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub pull_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            request_timeout: OLLAMA_REQUEST_TIMEOUT,
            pull_timeout: OLLAMA_PULL_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    pub fn new(client: Client, config: OllamaConfig) -> Self {
        Self { client, config }
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    pub fn timeout_for(&self, route: OllamaRoute) -> Duration {
        if route == OllamaRoute::Pull {
            self.config.pull_timeout
        } else {
            self.config.request_timeout
        }
    }

    /// Sends one request to Ollama and returns its status plus a verbatim
    /// body stream. Upstream error statuses are passed back to the caller
    /// as they are.
    pub async fn forward(
        &self,
        forward: OllamaForward,
        relay: RelayOptions,
    ) -> Result<UpstreamResponse, ProviderError> {
        let timeout = self.timeout_for(forward.route);
        let url = format!("{}/{}", self.base_url(), forward.route.path());

        let mut req = self.client.request(forward.method.clone(), &url).header(
            reqwest::header::USER_AGENT,
            forward
                .user_agent
                .as_deref()
                .unwrap_or(DEFAULT_USER_AGENT),
        );
        if let Some(accept) = forward.accept.as_deref() {
            req = req.header(reqwest::header::ACCEPT, accept);
        }
        let is_json_payload = matches!(
            forward.payload,
            OllamaPayload::Chat(_) | OllamaPayload::Json(_)
        );
        if let Some(bytes) = forward.payload.into_bytes()? {
            let content_type = if is_json_payload {
                "application/json".to_string()
            } else {
                forward
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string())
            };
            req = req
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes);
        }

        tracing::debug!(
            request_id = %relay.request_id,
            method = %forward.method,
            url = %url,
            timeout_secs = timeout.as_secs(),
            "forwarding to ollama"
        );

        let resp = match tokio::time::timeout(timeout, req.send()).await {
            Err(_) => return Err(ProviderError::Timeout(timeout)),
            Ok(Err(err)) => return Err(ProviderError::from_reqwest(err, timeout)),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !status.is_success() {
            tracing::warn!(
                request_id = %relay.request_id,
                status = status.as_u16(),
                route = forward.route.path(),
                "ollama returned an error status"
            );
        }

        let relay = RelayOptions {
            idle_timeout: timeout,
            ..relay
        };
        Ok(UpstreamResponse {
            status,
            content_type,
            body: relay_ollama(resp.bytes_stream(), relay),
        })
    }
}
