use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OllamaChunkMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

/// One NDJSON line from Ollama `/api/chat` or `/api/generate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OllamaChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<OllamaChunkMessage>,
    /// `/api/generate` streams text here instead of `message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiChoice {
    #[serde(default)]
    pub delta: OpenAiDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// One `data:` payload from an OpenAI-compatible chat completion stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OpenAiChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<OpenAiUsage>,
}

impl OpenAiChunk {
    pub fn delta(&self) -> Option<&OpenAiDelta> {
        self.choices.first().map(|c| &c.delta)
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .iter()
            .find_map(|c| c.finish_reason.as_deref())
    }
}

#[derive(Debug, Clone)]
pub enum SseEvent {
    Chunk(OpenAiChunk),
    Done,
}

/// Reads one SSE line. Comments, `event:` lines, blank lines and payloads
/// that are not valid chunks yield `None`.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    serde_json::from_str::<OpenAiChunk>(data)
        .ok()
        .map(SseEvent::Chunk)
}

pub fn parse_ollama_line(line: &str) -> Option<OllamaChunk> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// A streamed chunk from either backend, tagged at the parse boundary.
#[derive(Debug, Clone)]
pub enum BackendStreamChunk {
    Ollama(OllamaChunk),
    OpenAi(OpenAiChunk),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub eval_count: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub eval_duration: Option<u64>,
    pub total_duration: Option<u64>,
}

/// The only line shape callers ever receive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: String,
    pub message: RelayMessage,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl RelayRecord {
    fn assistant(model: Option<&str>, content: String, thinking: Option<String>) -> Self {
        Self {
            model: model.map(str::to_string),
            created_at: now_rfc3339(),
            message: RelayMessage {
                role: "assistant".to_string(),
                content,
                thinking,
            },
            ..Default::default()
        }
    }

    /// The closing `done:true` record. Stats are omitted when unknown.
    pub fn terminal(model: Option<&str>, done_reason: Option<&str>, stats: RelayStats) -> Self {
        let mut record = Self::assistant(model, String::new(), None);
        record.done = true;
        record.done_reason = done_reason.map(str::to_string);
        record.apply_stats(stats);
        record
    }

    fn apply_stats(&mut self, stats: RelayStats) {
        self.eval_count = stats.eval_count;
        self.prompt_eval_count = stats.prompt_eval_count;
        self.eval_duration = stats.eval_duration;
        self.total_duration = stats.total_duration;
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            eval_count: self.eval_count,
            prompt_eval_count: self.prompt_eval_count,
            eval_duration: self.eval_duration,
            total_duration: self.total_duration,
        }
    }

    pub fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

impl BackendStreamChunk {
    /// Maps either backend shape onto the caller-facing record.
    ///
    /// OpenAI deltas are never terminal here; the relay synthesizes the
    /// closing record itself once the stream ends.
    pub fn into_record(self, model: Option<&str>) -> RelayRecord {
        match self {
            BackendStreamChunk::Ollama(chunk) => {
                let (content, thinking) = match chunk.message {
                    Some(message) => (message.content, message.thinking),
                    None => (chunk.response.unwrap_or_default(), None),
                };
                let mut record = RelayRecord::assistant(
                    chunk.model.as_deref().or(model),
                    content,
                    thinking.filter(|t| !t.is_empty()),
                );
                if let Some(created_at) = chunk.created_at {
                    record.created_at = created_at;
                }
                record.done = chunk.done;
                record.done_reason = chunk.done_reason;
                record.apply_stats(RelayStats {
                    eval_count: chunk.eval_count,
                    prompt_eval_count: chunk.prompt_eval_count,
                    eval_duration: chunk.eval_duration,
                    total_duration: chunk.total_duration,
                });
                record
            }
            BackendStreamChunk::OpenAi(chunk) => {
                let delta = chunk.choices.into_iter().next().map(|c| c.delta);
                let (content, thinking) = match delta {
                    Some(delta) => (
                        delta.content.unwrap_or_default(),
                        delta.reasoning_content.filter(|r| !r.is_empty()),
                    ),
                    None => (String::new(), None),
                };
                RelayRecord::assistant(chunk.model.as_deref().or(model), content, thinking)
            }
        }
    }
}
