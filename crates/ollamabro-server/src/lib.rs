use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use ollamabro_providers::{LlamaCppBackend, OllamaBackend, OllamaConfig};
use ollamabro_runtime::{BackendProcessManager, LlamaServerConfig};
use ollamabro_tools::{Enricher, JinaReader, TavilyClient};

mod config;
mod error;
mod http;

pub use config::{ensure_loopback_url, AllowedOrigins, GatewayConfig, EXTENSION_ORIGIN};
pub use error::{ErrorEnvelope, GatewayError};
pub use http::{app_router, serve, MAX_BODY_BYTES, SHUTDOWN_DELAY};

/// Everything a handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub ollama: OllamaBackend,
    pub llamacpp: LlamaCppBackend,
    pub enricher: Enricher,
    pub backend: BackendProcessManager,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: GatewayConfig, llama: LlamaServerConfig) -> Self {
        let client = reqwest::Client::new();
        let reader = JinaReader::new(client.clone(), config.reader_url.clone());
        let search = TavilyClient::new(client.clone(), config.tavily_api_key.clone())
            .with_endpoints(config.search_url.clone(), config.research_url.clone());
        if !search.is_configured() {
            tracing::warn!("TAVILY_API_KEY is not set; web search and deep research are disabled");
        }
        let enricher = Enricher::new(Arc::new(reader), Arc::new(search));
        Self::with_enricher(config, llama, client, enricher)
    }

    pub fn with_enricher(
        config: GatewayConfig,
        llama: LlamaServerConfig,
        client: reqwest::Client,
        enricher: Enricher,
    ) -> Self {
        let ollama = OllamaBackend::new(
            client.clone(),
            OllamaConfig {
                base_url: config.ollama_url.clone(),
                request_timeout: config.ollama_request_timeout,
                pull_timeout: config.ollama_pull_timeout,
            },
        );
        let llamacpp = LlamaCppBackend::new(client.clone(), config.llamacpp_timeout);
        Self {
            config: Arc::new(config),
            ollama,
            llamacpp,
            enricher,
            backend: BackendProcessManager::with_client(llama, client),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
