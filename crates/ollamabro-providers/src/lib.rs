//! Backend adapters for the gateway: allow-listed Ollama forwarding, the
//! OpenAI-style llama.cpp translation, and the streaming relay that turns
//! either backend's body into caller-facing NDJSON.

mod error;
mod llamacpp;
mod ollama;
pub mod relay;

pub use error::ProviderError;
pub use llamacpp::{
    build_openai_body, image_data_uri, LlamaCppBackend, LocalTarget, LLAMACPP_REQUEST_TIMEOUT,
};
pub use ollama::{
    OllamaBackend, OllamaConfig, OllamaForward, OllamaPayload, OllamaRoute, UpstreamResponse,
    DEFAULT_OLLAMA_URL, DEFAULT_USER_AGENT, OLLAMA_PULL_TIMEOUT, OLLAMA_REQUEST_TIMEOUT,
};
pub use relay::{LineBuffer, RelayOptions, RelayStream};

/// Which backend serves a chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ollama,
    LlamaCpp,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::LlamaCpp => "llamacpp",
        }
    }
}
