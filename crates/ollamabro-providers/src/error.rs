use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("path `{0}` is not allowed")]
    PathNotAllowed(String),

    #[error("local backend is not ready (status: {0})")]
    BackendNotReady(String),

    #[error("upstream did not respond within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("upstream returned {status}: {detail}")]
    Upstream { status: u16, detail: String },

    #[error("upstream stream stalled for {}s", .0.as_secs())]
    StreamIdle(Duration),

    #[error("upstream stream failed: {0}")]
    Stream(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::Unreachable(err.to_string())
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::PathNotAllowed(_) => "PATH_NOT_ALLOWED",
            ProviderError::BackendNotReady(_) => "BACKEND_NOT_READY",
            ProviderError::Timeout(_) | ProviderError::StreamIdle(_) => "GATEWAY_TIMEOUT",
            ProviderError::Unreachable(_) | ProviderError::Stream(_) => "UPSTREAM_UNREACHABLE",
            ProviderError::Upstream { .. } => "UPSTREAM_ERROR",
            ProviderError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

/// Pulls `error.message` (or a bare `error` / `message` string) out of an
/// OpenAI-style error body.
pub(crate) fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message").or(Some(v)))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}
