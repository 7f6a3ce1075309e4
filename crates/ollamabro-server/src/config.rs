use std::net::IpAddr;
use std::time::Duration;

use ollamabro_providers::{
    DEFAULT_OLLAMA_URL, LLAMACPP_REQUEST_TIMEOUT, OLLAMA_PULL_TIMEOUT, OLLAMA_REQUEST_TIMEOUT,
};
use ollamabro_runtime::llmfit::{DEFAULT_LLMFIT, LLMFIT_TIMEOUT};
use ollamabro_tools::{DEFAULT_READER_URL, DEFAULT_RESEARCH_URL, DEFAULT_SEARCH_URL};

pub const EXTENSION_ORIGIN: &str = "chrome-extension://gkpfpdekobmonacdgjgbfehilnloaacm";

/// Browser origins allowed to call the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    /// `*` anywhere in the list allows every origin. Entries may themselves be
    /// comma-separated.
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Self {
        let mut origins = Vec::new();
        for value in values {
            for origin in value.as_ref().split(',') {
                let origin = origin.trim().trim_end_matches('/');
                if origin == "*" {
                    return AllowedOrigins::Any;
                }
                if !origin.is_empty() && !origins.iter().any(|o| o == origin) {
                    origins.push(origin.to_string());
                }
            }
        }
        AllowedOrigins::List(origins)
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::List(list) => {
                let origin = origin.trim_end_matches('/');
                list.iter().any(|allowed| allowed == origin)
            }
        }
    }
}

impl Default for AllowedOrigins {
    fn default() -> Self {
        AllowedOrigins::List(vec![EXTENSION_ORIGIN.to_string()])
    }
}

/// Network-facing settings fixed at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ollama_url: String,
    pub allowed_origins: AllowedOrigins,
    pub tavily_api_key: Option<String>,
    pub reader_url: String,
    pub search_url: String,
    pub research_url: String,
    pub llmfit_path: String,
    pub ollama_request_timeout: Duration,
    pub ollama_pull_timeout: Duration,
    pub llamacpp_timeout: Duration,
    pub llmfit_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            allowed_origins: AllowedOrigins::default(),
            tavily_api_key: None,
            reader_url: DEFAULT_READER_URL.to_string(),
            search_url: DEFAULT_SEARCH_URL.to_string(),
            research_url: DEFAULT_RESEARCH_URL.to_string(),
            llmfit_path: DEFAULT_LLMFIT.to_string(),
            ollama_request_timeout: OLLAMA_REQUEST_TIMEOUT,
            ollama_pull_timeout: OLLAMA_PULL_TIMEOUT,
            llamacpp_timeout: LLAMACPP_REQUEST_TIMEOUT,
            llmfit_timeout: LLMFIT_TIMEOUT,
        }
    }
}

/// Rejects Ollama URLs that would send traffic off this machine.
pub fn ensure_loopback_url(raw: &str) -> Result<(), String> {
    let url = reqwest::Url::parse(raw).map_err(|e| format!("invalid URL `{raw}`: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme `{}` in `{raw}`", url.scheme()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| format!("URL `{raw}` has no host"))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => Ok(()),
        _ => Err(format!("host `{host}` is not a loopback address")),
    }
}
