use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("{0} API key is not configured")]
    MissingApiKey(&'static str),

    #[error("{service} timed out after {}s", .timeout.as_secs())]
    Timeout {
        service: &'static str,
        timeout: Duration,
    },

    #[error("{service} request failed: {detail}")]
    Request {
        service: &'static str,
        detail: String,
    },

    #[error("{service} returned HTTP {status}")]
    Status { service: &'static str, status: u16 },

    #[error("{service} returned an unreadable body: {detail}")]
    Parse {
        service: &'static str,
        detail: String,
    },

    #[error("{0} returned no content")]
    Empty(&'static str),
}

impl EnrichmentError {
    pub(crate) fn from_reqwest(service: &'static str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EnrichmentError::Timeout { service, timeout }
        } else {
            EnrichmentError::Request {
                service,
                detail: err.to_string(),
            }
        }
    }

    /// Missing credentials are expected configuration, not failures.
    pub fn is_unconfigured(&self) -> bool {
        matches!(self, EnrichmentError::MissingApiKey(_))
    }
}
