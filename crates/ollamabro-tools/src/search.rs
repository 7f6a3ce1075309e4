use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ollamabro_observability::redact_text;

use crate::error::EnrichmentError;
use crate::triggers::truncate_chars;

pub const DEFAULT_SEARCH_URL: &str = "https://api.tavily.com/search";
pub const DEFAULT_RESEARCH_URL: &str = "https://api.tavily.com/research";
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const RESEARCH_TIMEOUT: Duration = Duration::from_secs(120);
pub const MAX_SEARCH_RESULTS: usize = 5;
pub const MAX_QUERY_CHARS: usize = 300;
pub const MAX_SNIPPET_CHARS: usize = 1000;
pub const MAX_REPORT_CHARS: usize = 8000;
pub const RESEARCH_DEPTH: u32 = 2;
pub const RESEARCH_BREADTH: u32 = 3;

const PLACEHOLDER_KEYS: [&str; 3] = ["your_tavily_api_key_here", "placeholder", "x"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResearchReport {
    pub report: String,
    pub sources: Vec<SearchHit>,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, EnrichmentError>;
    async fn research(&self, query: &str) -> Result<ResearchReport, EnrichmentError>;
}

pub fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || PLACEHOLDER_KEYS
            .iter()
            .any(|p| trimmed.eq_ignore_ascii_case(p))
}

/// Tavily search plus a research endpoint with the same credentials.
#[derive(Clone)]
pub struct TavilyClient {
    client: Client,
    api_key: Option<String>,
    search_url: String,
    research_url: String,
    search_timeout: Duration,
    research_timeout: Duration,
}

impl fmt::Debug for TavilyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TavilyClient")
            .field("api_key", &self.api_key.as_deref().map(redact_text))
            .field("search_url", &self.search_url)
            .field("research_url", &self.research_url)
            .finish()
    }
}

impl TavilyClient {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key: api_key.filter(|k| !is_placeholder_api_key(k)),
            search_url: DEFAULT_SEARCH_URL.to_string(),
            research_url: DEFAULT_RESEARCH_URL.to_string(),
            search_timeout: SEARCH_TIMEOUT,
            research_timeout: RESEARCH_TIMEOUT,
        }
    }

    pub fn with_endpoints(
        mut self,
        search_url: impl Into<String>,
        research_url: impl Into<String>,
    ) -> Self {
        self.search_url = search_url.into();
        self.research_url = research_url.into();
        self
    }

    pub fn with_timeouts(mut self, search: Duration, research: Duration) -> Self {
        self.search_timeout = search;
        self.research_timeout = research;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn key(&self, service: &'static str) -> Result<&str, EnrichmentError> {
        self.api_key
            .as_deref()
            .ok_or(EnrichmentError::MissingApiKey(service))
    }

    async fn post(
        &self,
        service: &'static str,
        url: &str,
        timeout: Duration,
        body: Value,
    ) -> Result<Value, EnrichmentError> {
        let resp = self
            .client
            .post(url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| EnrichmentError::from_reqwest(service, timeout, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EnrichmentError::Status {
                service,
                status: status.as_u16(),
            });
        }
        resp.json::<Value>()
            .await
            .map_err(|e| EnrichmentError::Parse {
                service,
                detail: e.to_string(),
            })
    }
}

#[async_trait]
impl WebSearch for TavilyClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, EnrichmentError> {
        const SERVICE: &str = "search";
        let api_key = self.key(SERVICE)?;
        let body = json!({
            "api_key": api_key,
            "query": truncate_chars(query, MAX_QUERY_CHARS),
            "max_results": MAX_SEARCH_RESULTS,
            "search_depth": "basic",
        });
        let value = self
            .post(SERVICE, &self.search_url, self.search_timeout, body)
            .await?;
        Ok(parse_hits(value.get("results")))
    }

    async fn research(&self, query: &str) -> Result<ResearchReport, EnrichmentError> {
        const SERVICE: &str = "research";
        let api_key = self.key(SERVICE)?;
        let body = json!({
            "api_key": api_key,
            "query": truncate_chars(query, MAX_QUERY_CHARS),
            "depth": RESEARCH_DEPTH,
            "breadth": RESEARCH_BREADTH,
        });
        let value = self
            .post(SERVICE, &self.research_url, self.research_timeout, body)
            .await?;
        let report = ["report", "content", "answer"]
            .iter()
            .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or(EnrichmentError::Empty(SERVICE))?
            .to_string();
        let sources = parse_hits(value.get("sources").or_else(|| value.get("results")));
        Ok(ResearchReport { report, sources })
    }
}

fn parse_hits(value: Option<&Value>) -> Vec<SearchHit> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<SearchHit>(item.clone()).ok())
                .filter(|hit| !hit.url.is_empty() || !hit.content.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// `Web search results:` block, or `None` for an empty result list.
pub fn format_search_results(hits: &[SearchHit]) -> Option<String> {
    if hits.is_empty() {
        return None;
    }
    let snippets = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            format!(
                "[{}] {} - {}\n{}",
                i + 1,
                hit.title,
                hit.url,
                truncate_chars(hit.content.trim(), MAX_SNIPPET_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    Some(format!("Web search results:\n{snippets}"))
}

pub fn format_research_report(report: &ResearchReport) -> String {
    let mut out = format!(
        "Research report:\n{}",
        truncate_chars(&report.report, MAX_REPORT_CHARS)
    );
    if !report.sources.is_empty() {
        out.push_str("\n\nSources:");
        for (i, source) in report.sources.iter().enumerate() {
            out.push_str(&format!("\n[{}] {} - {}", i + 1, source.title, source.url));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    #[test]
    fn placeholder_keys_count_as_missing() {
        assert!(is_placeholder_api_key("your_tavily_api_key_here"));
        assert!(is_placeholder_api_key("  "));
        assert!(!is_placeholder_api_key("tvly-abc"));
        assert!(!TavilyClient::new(Client::new(), Some("your_tavily_api_key_here".into()))
            .is_configured());
    }

    #[tokio::test]
    async fn missing_key_skips_without_network() {
        let client = TavilyClient::new(Client::new(), None)
            .with_endpoints("http://127.0.0.1:1/search", "http://127.0.0.1:1/research");
        let err = client.search("q").await.err().expect("error");
        assert!(err.is_unconfigured());
    }

    #[tokio::test]
    async fn search_sends_bounded_query_and_parses_results() {
        let app = Router::new().route(
            "/search",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "echo": body,
                    "results": [
                        {"title": "Paris weather", "url": "https://w.example/paris", "content": "Sunny, 21C"},
                        {"title": "junk"}
                    ]
                }))
            }),
        );
        let base = spawn(app).await;
        let client = TavilyClient::new(Client::new(), Some("tvly-test".into()))
            .with_endpoints(format!("{base}/search"), format!("{base}/research"));
        let hits = client.search(&"q".repeat(500)).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Paris weather");

        let block = format_search_results(&hits).expect("block");
        assert_eq!(
            block,
            "Web search results:\n[1] Paris weather - https://w.example/paris\nSunny, 21C"
        );
    }

    #[tokio::test]
    async fn research_reads_report_and_sources() {
        let app = Router::new().route(
            "/research",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["depth"], 2);
                assert_eq!(body["breadth"], 3);
                Json(json!({
                    "report": "Findings.",
                    "sources": [{"title": "Src", "url": "https://s.example"}]
                }))
            }),
        );
        let base = spawn(app).await;
        let client = TavilyClient::new(Client::new(), Some("tvly-test".into()))
            .with_endpoints(format!("{base}/search"), format!("{base}/research"));
        let report = client.research("topic").await.expect("research");
        assert_eq!(
            format_research_report(&report),
            "Research report:\nFindings.\n\nSources:\n[1] Src - https://s.example"
        );
    }

    #[test]
    fn debug_output_hides_api_key() {
        let client = TavilyClient::new(Client::new(), Some("tvly-secret-key".into()));
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("tvly-secret-key"));
    }
}
