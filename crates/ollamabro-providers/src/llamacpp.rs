use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Map, Value};

use ollamabro_types::{ChatMessage, ChatOptions, ChatRequest};

use crate::error::{extract_openai_error, truncate_for_error, ProviderError};
use crate::relay::{relay_openai, RelayOptions, RelayStream};

pub const LLAMACPP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a ready llama-server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub port: u16,
    pub model_name: String,
}

#[derive(Clone)]
pub struct LlamaCppBackend {
    client: Client,
    request_timeout: Duration,
}

impl LlamaCppBackend {
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    /// Opens a streamed chat completion against the local server and
    /// returns it already converted to caller-facing NDJSON.
    ///
    /// `target` is `Err(status)` when the process manager is not ready.
    pub async fn chat(
        &self,
        target: Result<LocalTarget, String>,
        request: &ChatRequest,
        relay: RelayOptions,
    ) -> Result<RelayStream, ProviderError> {
        let target = target.map_err(ProviderError::BackendNotReady)?;
        let url = format!("http://127.0.0.1:{}/v1/chat/completions", target.port);
        let body = build_openai_body(&target.model_name, request);

        tracing::debug!(
            request_id = %relay.request_id,
            model = %target.model_name,
            messages = request.messages.len(),
            "forwarding to llama.cpp"
        );

        let timeout = self.request_timeout;
        let send = self.client.post(&url).json(&body).send();
        let resp = match tokio::time::timeout(timeout, send).await {
            Err(_) => return Err(ProviderError::Timeout(timeout)),
            Ok(Err(err)) => return Err(ProviderError::from_reqwest(err, timeout)),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| extract_openai_error(&v))
                .unwrap_or_else(|| truncate_for_error(&text, 500));
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                detail,
            });
        }

        let relay = RelayOptions {
            idle_timeout: timeout,
            ..relay
        };
        Ok(relay_openai(
            resp.bytes_stream(),
            Some(target.model_name),
            relay,
        ))
    }
}

/// Translates an Ollama-shaped chat request into an OpenAI chat
/// completion body with usage reporting switched on.
pub fn build_openai_body(model: &str, request: &ChatRequest) -> Value {
    let messages = request
        .messages
        .iter()
        .map(openai_message)
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    if let (Some(options), Some(obj)) = (request.options.as_ref(), body.as_object_mut()) {
        obj.extend(openai_options(options));
    }
    body
}

fn openai_message(message: &ChatMessage) -> Value {
    let images = message
        .images
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|img| !img.is_empty())
        .collect::<Vec<_>>();
    if images.is_empty() {
        return json!({ "role": message.role.as_str(), "content": message.content });
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    if !message.content.is_empty() {
        parts.push(json!({ "type": "text", "text": message.content }));
    }
    for image in images {
        parts.push(json!({
            "type": "image_url",
            "image_url": { "url": image_data_uri(image) },
        }));
    }
    json!({ "role": message.role.as_str(), "content": parts })
}

fn openai_options(options: &ChatOptions) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(v) = options.temperature {
        out.insert("temperature".into(), json!(v));
    }
    if let Some(v) = options.top_p {
        out.insert("top_p".into(), json!(v));
    }
    if let Some(v) = options.top_k {
        out.insert("top_k".into(), json!(v));
    }
    if let Some(v) = options.repeat_penalty {
        out.insert("repeat_penalty".into(), json!(v));
    }
    if let Some(v) = options.seed {
        out.insert("seed".into(), json!(v));
    }
    // Ollama uses -1/-2 for "unbounded"; OpenAI has no equivalent.
    if let Some(v) = options.num_predict.filter(|v| *v > 0) {
        out.insert("max_tokens".into(), json!(v));
    }
    if let Some(stop) = options.stop.as_ref().filter(|s| !s.is_empty()) {
        out.insert("stop".into(), json!(stop));
    }
    out
}

/// Wraps a bare base64 image in a data URI, guessing the MIME type from the
/// encoded magic bytes.
pub fn image_data_uri(image: &str) -> String {
    if image.starts_with("data:") {
        return image.to_string();
    }
    let mime = if image.starts_with("iVBOR") {
        "image/png"
    } else if image.starts_with("R0lGOD") {
        "image/gif"
    } else if image.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/jpeg"
    };
    format!("data:{mime};base64,{image}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> ChatRequest {
        serde_json::from_value(value).expect("chat request")
    }

    #[test]
    fn options_are_renamed_for_openai() {
        let req = request(json!({
            "model": "ignored",
            "messages": [{"role": "user", "content": "hi"}],
            "options": {
                "temperature": 0.7, "top_p": 0.9, "top_k": 40,
                "repeat_penalty": 1.1, "seed": 7, "num_predict": 256,
                "num_ctx": 8192, "stop": ["</s>"]
            },
            "_webSearch": true
        }));
        let body = build_openai_body("qwen.gguf", &req);
        assert_eq!(body["model"], "qwen.gguf");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["top_k"], 40);
        assert_eq!(body["seed"], 7);
        assert_eq!(body["stop"], json!(["</s>"]));
        assert!(body.get("num_predict").is_none());
        assert!(body.get("num_ctx").is_none());
        assert!(body.get("_webSearch").is_none());
    }

    #[test]
    fn unbounded_num_predict_is_dropped() {
        let req = request(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "options": {"num_predict": -1}
        }));
        assert!(build_openai_body("m", &req).get("max_tokens").is_none());
    }

    #[test]
    fn images_become_content_parts() {
        let req = request(json!({
            "messages": [{"role": "user", "content": "what is this", "images": ["iVBORw0KGgoAAA", "/9j/4AAQ"]}]
        }));
        let body = build_openai_body("m", &req);
        let parts = body["messages"][0]["content"].as_array().expect("parts");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["text"], "what is this");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/png;base64,iVBORw0KGgoAAA"
        );
        assert_eq!(
            parts[2]["image_url"]["url"],
            "data:image/jpeg;base64,/9j/4AAQ"
        );
    }

    #[tokio::test]
    async fn refuses_when_backend_not_ready() {
        let backend = LlamaCppBackend::new(Client::new(), LLAMACPP_REQUEST_TIMEOUT);
        let req = request(json!({"messages": []}));
        let err = backend
            .chat(
                Err("loading".to_string()),
                &req,
                RelayOptions::new(Duration::from_secs(1), "t"),
            )
            .await
            .err()
            .expect("not ready");
        assert!(matches!(err, ProviderError::BackendNotReady(s) if s == "loading"));
    }
}
