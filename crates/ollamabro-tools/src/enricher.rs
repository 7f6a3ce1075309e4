use std::sync::Arc;

use chrono::{Local, NaiveDate};
use futures::future::join_all;

use ollamabro_types::{ChatRequest, EnrichmentBlock, EnrichmentContext, EnrichmentSource};

use crate::error::EnrichmentError;
use crate::reader::PageReader;
use crate::search::{format_research_report, format_search_results, WebSearch};
use crate::triggers::{extract_urls, needs_search};

pub const MAX_FETCHED_URLS: usize = 2;

pub type BlockResult = Result<EnrichmentBlock, EnrichmentError>;

/// What enrichment did for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentSummary {
    pub pages: usize,
    pub searched: bool,
    pub researched: bool,
    pub failures: usize,
    pub injected: bool,
}

#[derive(Clone)]
pub struct Enricher {
    reader: Arc<dyn PageReader>,
    search: Arc<dyn WebSearch>,
    max_urls: usize,
}

impl Enricher {
    pub fn new(reader: Arc<dyn PageReader>, search: Arc<dyn WebSearch>) -> Self {
        Self {
            reader,
            search,
            max_urls: MAX_FETCHED_URLS,
        }
    }

    /// Runs every applicable lookup for `text`. Each entry is either a
    /// finished block or the reason it is missing; none of them abort the
    /// others.
    pub async fn collect(&self, text: &str, web_search: bool, deep_research: bool) -> Vec<BlockResult> {
        let urls = extract_urls(text);
        let page_reads = urls
            .iter()
            .take(self.max_urls)
            .map(|url| self.read_page(url));

        let (pages, lookup) = tokio::join!(join_all(page_reads), async {
            if deep_research {
                Some(self.research_with_fallback(text).await)
            } else if web_search || needs_search(text) {
                Some(self.search_block(text).await)
            } else {
                None
            }
        });

        let mut results = pages;
        results.extend(lookup);
        results
    }

    async fn read_page(&self, url: &str) -> BlockResult {
        let content = self.reader.read(url).await?;
        Ok(EnrichmentBlock::new(
            EnrichmentSource::Page,
            format!("Retrieved page ({url}):\n{content}"),
        ))
    }

    async fn search_block(&self, query: &str) -> BlockResult {
        let hits = self.search.search(query).await?;
        format_search_results(&hits)
            .map(|text| EnrichmentBlock::new(EnrichmentSource::Search, text))
            .ok_or(EnrichmentError::Empty("search"))
    }

    async fn research_with_fallback(&self, query: &str) -> BlockResult {
        match self.search.research(query).await {
            Ok(report) => Ok(EnrichmentBlock::new(
                EnrichmentSource::Research,
                format_research_report(&report),
            )),
            Err(err) => {
                tracing::warn!(error = %err, "deep research failed, falling back to web search");
                self.search_block(query).await
            }
        }
    }

    /// Enriches the request in place when its last message is from the
    /// user. Failed lookups are logged and dropped.
    pub async fn enrich(&self, request: &mut ChatRequest, request_id: &str) -> EnrichmentSummary {
        let today = Local::now().date_naive();
        self.enrich_on(request, request_id, today).await
    }

    pub async fn enrich_on(
        &self,
        request: &mut ChatRequest,
        request_id: &str,
        today: NaiveDate,
    ) -> EnrichmentSummary {
        let mut summary = EnrichmentSummary::default();
        let Some(text) = request.latest_user_text().map(str::to_string) else {
            return summary;
        };

        let results = self
            .collect(&text, request.web_search, request.deep_research)
            .await;

        let mut context = EnrichmentContext::new(today);
        for result in results {
            match result {
                Ok(block) => {
                    match block.source {
                        EnrichmentSource::Page => summary.pages += 1,
                        EnrichmentSource::Search => summary.searched = true,
                        EnrichmentSource::Research => summary.researched = true,
                    }
                    context.push(block);
                }
                Err(err) if err.is_unconfigured() => {
                    tracing::warn!(request_id, error = %err, "skipping lookup");
                }
                Err(EnrichmentError::Empty(service)) => {
                    tracing::debug!(request_id, service, "lookup returned nothing");
                }
                Err(err) => {
                    summary.failures += 1;
                    tracing::warn!(request_id, error = %err, "lookup failed, continuing without it");
                }
            }
        }

        if let Some(block) = context.render() {
            request.merge_system_context(&block);
            summary.injected = true;
        }
        tracing::info!(
            request_id,
            pages = summary.pages,
            searched = summary.searched,
            researched = summary.researched,
            failures = summary.failures,
            "enrichment finished"
        );
        summary
    }
}
