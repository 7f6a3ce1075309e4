use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CONTEXT_PREAMBLE: &str = "The following information was retrieved by a tool before this conversation. Use it to answer the user directly - do not say you cannot access the internet, as this data is already provided to you.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentSource {
    Page,
    Search,
    Research,
}

/// One retrieved text block, already capped and formatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentBlock {
    pub source: EnrichmentSource,
    pub text: String,
}

impl EnrichmentBlock {
    pub fn new(source: EnrichmentSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
        }
    }
}

/// Per-request collection of retrieved blocks, rendered into one preamble.
#[derive(Debug, Clone)]
pub struct EnrichmentContext {
    pub blocks: Vec<EnrichmentBlock>,
    pub today: NaiveDate,
}

impl EnrichmentContext {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            blocks: Vec::new(),
            today,
        }
    }

    pub fn push(&mut self, block: EnrichmentBlock) {
        self.blocks.push(block);
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// `None` when nothing was retrieved.
    pub fn render(&self) -> Option<String> {
        if self.blocks.is_empty() {
            return None;
        }
        let body = self
            .blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        Some(format!(
            "{CONTEXT_PREAMBLE}\n\n{body}\n\nToday's date: {}.",
            self.today.format("%Y-%m-%d")
        ))
    }
}
