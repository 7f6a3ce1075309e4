use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::EnrichmentError;
use crate::triggers::truncate_chars;

pub const DEFAULT_READER_URL: &str = "https://r.jina.ai";
pub const READER_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_PAGE_CHARS: usize = 4000;

const SERVICE: &str = "reader";

/// Fetches a text rendering of a web page.
#[async_trait]
pub trait PageReader: Send + Sync {
    async fn read(&self, url: &str) -> Result<String, EnrichmentError>;
}

/// Page-to-text through a Jina-style reader (`{base}/{url}`).
#[derive(Clone)]
pub struct JinaReader {
    client: Client,
    base_url: String,
    timeout: Duration,
    max_chars: usize,
}

impl JinaReader {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout: READER_TIMEOUT,
            max_chars: MAX_PAGE_CHARS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl PageReader for JinaReader {
    async fn read(&self, url: &str) -> Result<String, EnrichmentError> {
        let endpoint = format!("{}/{}", self.base_url.trim_end_matches('/'), url);
        let resp = self
            .client
            .get(&endpoint)
            .header(reqwest::header::ACCEPT, "text/plain")
            .header("X-No-Cache", "true")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| EnrichmentError::from_reqwest(SERVICE, self.timeout, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EnrichmentError::Status {
                service: SERVICE,
                status: status.as_u16(),
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| EnrichmentError::from_reqwest(SERVICE, self.timeout, e))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(EnrichmentError::Empty(SERVICE));
        }
        Ok(truncate_chars(text, self.max_chars))
    }
}
