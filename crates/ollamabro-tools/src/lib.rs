mod enricher;
mod error;
mod reader;
mod search;
mod triggers;

pub use enricher::{BlockResult, Enricher, EnrichmentSummary, MAX_FETCHED_URLS};
pub use error::EnrichmentError;
pub use reader::{JinaReader, PageReader, DEFAULT_READER_URL, MAX_PAGE_CHARS, READER_TIMEOUT};
pub use search::{
    format_research_report, format_search_results, is_placeholder_api_key, ResearchReport,
    SearchHit, TavilyClient, WebSearch, DEFAULT_RESEARCH_URL, DEFAULT_SEARCH_URL,
    RESEARCH_TIMEOUT, SEARCH_TIMEOUT,
};
pub use triggers::{extract_urls, needs_search, truncate_chars};
