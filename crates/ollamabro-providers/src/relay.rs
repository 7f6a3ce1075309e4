use std::pin::Pin;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use ollamabro_types::{
    parse_ollama_line, parse_sse_line, BackendStreamChunk, OpenAiChunk, OpenAiUsage, RelayRecord,
    RelayStats, SseEvent,
};

use crate::error::ProviderError;

pub type RelayStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ProviderError>> + Send>>;

/// Accumulates raw bytes and hands out complete `\n`-terminated lines.
/// Whatever follows the last newline stays buffered for the next read.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line including its trailing newline.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        Some(self.buf.drain(..=pos).collect())
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Longest gap tolerated between two upstream reads.
    pub idle_timeout: Duration,
    /// Ends the relay early, e.g. on gateway shutdown.
    pub cancel: CancellationToken,
    pub request_id: String,
}

impl RelayOptions {
    pub fn new(idle_timeout: Duration, request_id: impl Into<String>) -> Self {
        Self {
            idle_timeout,
            cancel: CancellationToken::new(),
            request_id: request_id.into(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

enum Read<T> {
    Chunk(T),
    End,
    Cancelled,
}

async fn next_read<S, B, E>(
    upstream: &mut S,
    opts: &RelayOptions,
) -> Result<Read<B>, ProviderError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    E: std::fmt::Display,
{
    tokio::select! {
        biased;
        _ = opts.cancel.cancelled() => Ok(Read::Cancelled),
        next = tokio::time::timeout(opts.idle_timeout, upstream.next()) => match next {
            Err(_) => Err(ProviderError::StreamIdle(opts.idle_timeout)),
            Ok(None) => Ok(Read::End),
            Ok(Some(Err(err))) => Err(ProviderError::Stream(err.to_string())),
            Ok(Some(Ok(chunk))) => Ok(Read::Chunk(chunk)),
        },
    }
}

/// Pipes an Ollama NDJSON body through unchanged, one line at a time.
/// Lines are parsed only to log the terminal statistics.
pub fn relay_ollama<S, B, E>(upstream: S, opts: RelayOptions) -> RelayStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let mut upstream = upstream;
    let stream = try_stream! {
        let mut lines = LineBuffer::new();
        loop {
            let chunk = match next_read(&mut upstream, &opts).await? {
                Read::Chunk(chunk) => chunk,
                Read::End => break,
                Read::Cancelled => {
                    tracing::debug!(request_id = %opts.request_id, "ollama relay cancelled");
                    break;
                }
            };
            lines.push(chunk.as_ref());
            while let Some(line) = lines.next_line() {
                log_ollama_terminal(&line, &opts.request_id);
                yield line;
            }
        }
        if let Some(rest) = lines.take_remainder() {
            log_ollama_terminal(&rest, &opts.request_id);
            yield rest;
        }
    };
    Box::pin(stream)
}

fn log_ollama_terminal(line: &[u8], request_id: &str) {
    let Ok(text) = std::str::from_utf8(line) else {
        return;
    };
    let Some(chunk) = parse_ollama_line(text) else {
        return;
    };
    if !chunk.done {
        return;
    }
    let record = BackendStreamChunk::Ollama(chunk).into_record(None);
    let stats = record.stats();
    tracing::info!(
        request_id,
        backend = "ollama",
        model = record.model.as_deref().unwrap_or(""),
        eval_count = stats.eval_count.unwrap_or(0),
        prompt_eval_count = stats.prompt_eval_count.unwrap_or(0),
        eval_duration_ns = stats.eval_duration.unwrap_or(0),
        "chat stream finished"
    );
}

/// Timing and usage bookkeeping for one OpenAI-style stream.
#[derive(Debug)]
pub struct OpenAiRelayState {
    started: Instant,
    first_content_at: Option<Instant>,
    in_think: bool,
    usage: Option<OpenAiUsage>,
    finish_reason: Option<String>,
    deltas: usize,
}

impl OpenAiRelayState {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            first_content_at: None,
            in_think: false,
            usage: None,
            finish_reason: None,
            deltas: 0,
        }
    }

    pub fn observe(&mut self, chunk: &OpenAiChunk, at: Instant) {
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        if let Some(reason) = chunk.finish_reason() {
            self.finish_reason = Some(reason.to_string());
        }
        let Some(content) = chunk.delta().and_then(|d| d.content.as_deref()) else {
            return;
        };
        if content.is_empty() {
            return;
        }
        if self.first_content_at.is_none() && self.has_visible_content(content) {
            self.first_content_at = Some(at);
        }
    }

    // Inline <think>...</think> segments count as reasoning, not output.
    fn has_visible_content(&mut self, content: &str) -> bool {
        let mut rest = content;
        let mut visible = false;
        loop {
            if self.in_think {
                match rest.find("</think>") {
                    Some(end) => {
                        self.in_think = false;
                        rest = &rest[end + "</think>".len()..];
                    }
                    None => return visible,
                }
            } else {
                match rest.find("<think>") {
                    Some(start) => {
                        if !rest[..start].trim().is_empty() {
                            visible = true;
                        }
                        self.in_think = true;
                        rest = &rest[start + "<think>".len()..];
                    }
                    None => return visible || !rest.trim().is_empty(),
                }
            }
        }
    }

    pub fn usage(&self) -> Option<OpenAiUsage> {
        self.usage
    }

    /// Stats for the closing record, measured at `now`. Absent entirely
    /// when no usage chunk was seen.
    pub fn stats(&self, now: Instant) -> RelayStats {
        let Some(usage) = self.usage else {
            return RelayStats::default();
        };
        let eval_from = self.first_content_at.unwrap_or(self.started);
        let eval_ns = now.saturating_duration_since(eval_from).as_nanos();
        let total_ns = now.saturating_duration_since(self.started).as_nanos();
        RelayStats {
            eval_count: Some(usage.completion_tokens),
            prompt_eval_count: Some(usage.prompt_tokens),
            eval_duration: Some(clamp_nanos(eval_ns)),
            total_duration: Some(clamp_nanos(total_ns)),
        }
    }

    pub fn terminal(&self, model: Option<&str>, now: Instant) -> RelayRecord {
        RelayRecord::terminal(
            model,
            Some(self.finish_reason.as_deref().unwrap_or("stop")),
            self.stats(now),
        )
    }
}

fn clamp_nanos(ns: u128) -> u64 {
    u64::try_from(ns).unwrap_or(u64::MAX).max(1)
}

/// Converts an OpenAI-compatible SSE body into caller-facing NDJSON records,
/// closing with exactly one `done:true` record.
pub fn relay_openai<S, B, E>(upstream: S, model: Option<String>, opts: RelayOptions) -> RelayStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let mut upstream = upstream;
    let stream = try_stream! {
        let mut state = OpenAiRelayState::new(Instant::now());
        let mut lines = LineBuffer::new();
        let mut saw_done = false;
        'read: loop {
            let chunk = match next_read(&mut upstream, &opts).await? {
                Read::Chunk(chunk) => chunk,
                Read::End => break,
                Read::Cancelled => {
                    tracing::debug!(request_id = %opts.request_id, "llama.cpp relay cancelled");
                    break;
                }
            };
            lines.push(chunk.as_ref());
            while let Some(line) = lines.next_line() {
                match decode_sse(&line) {
                    Some(SseEvent::Done) => {
                        saw_done = true;
                        break 'read;
                    }
                    Some(SseEvent::Chunk(chunk)) => {
                        if let Some(record) = handle_openai_chunk(&mut state, chunk, model.as_deref()) {
                            yield record.to_ndjson().into_bytes();
                        }
                    }
                    None => {}
                }
            }
        }
        if !saw_done {
            // Final line may arrive without a trailing newline.
            if let Some(rest) = lines.take_remainder() {
                match decode_sse(&rest) {
                    Some(SseEvent::Chunk(chunk)) => {
                        if let Some(record) = handle_openai_chunk(&mut state, chunk, model.as_deref()) {
                            yield record.to_ndjson().into_bytes();
                        }
                    }
                    Some(SseEvent::Done) => saw_done = true,
                    None => {}
                }
            }
        }
        if !saw_done && !opts.cancel.is_cancelled() {
            tracing::warn!(request_id = %opts.request_id, "llama.cpp stream ended without [DONE]");
        }
        let terminal = state.terminal(model.as_deref(), Instant::now());
        let stats = terminal.stats();
        tracing::info!(
            request_id = %opts.request_id,
            backend = "llamacpp",
            model = model.as_deref().unwrap_or(""),
            deltas = state.deltas,
            eval_count = stats.eval_count.unwrap_or(0),
            prompt_eval_count = stats.prompt_eval_count.unwrap_or(0),
            eval_duration_ns = stats.eval_duration.unwrap_or(0),
            "chat stream finished"
        );
        yield terminal.to_ndjson().into_bytes();
    };
    Box::pin(stream)
}

fn decode_sse(line: &[u8]) -> Option<SseEvent> {
    parse_sse_line(&String::from_utf8_lossy(line))
}

fn handle_openai_chunk(
    state: &mut OpenAiRelayState,
    chunk: OpenAiChunk,
    model: Option<&str>,
) -> Option<RelayRecord> {
    state.observe(&chunk, Instant::now());
    let record = BackendStreamChunk::OpenAi(chunk).into_record(model);
    if record.message.content.is_empty() && record.message.thinking.is_none() {
        return None;
    }
    state.deltas += 1;
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::Value;

    type Item = Result<Vec<u8>, std::io::Error>;

    fn upstream(parts: &[&str]) -> impl Stream<Item = Item> + Send + Unpin + 'static {
        let items: Vec<Item> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(items)
    }

    fn opts() -> RelayOptions {
        RelayOptions::new(Duration::from_secs(5), "test")
    }

    async fn collect(stream: RelayStream) -> Vec<Value> {
        let chunks: Vec<_> = stream.collect().await;
        let bytes: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.expect("relay chunk"))
            .collect();
        String::from_utf8(bytes)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }

    #[test]
    fn line_buffer_keeps_partial_lines() {
        let mut buf = LineBuffer::new();
        buf.push(b"{\"a\":1}\n{\"b\"");
        assert_eq!(buf.next_line().as_deref(), Some(&b"{\"a\":1}\n"[..]));
        assert!(buf.next_line().is_none());
        assert_eq!(buf.pending(), 4);
        buf.push(b":2}\n");
        assert_eq!(buf.next_line().as_deref(), Some(&b"{\"b\":2}\n"[..]));
        assert!(buf.take_remainder().is_none());
    }

    #[tokio::test]
    async fn ollama_bytes_pass_through_unchanged() {
        let body = "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"message\":{\"content\":\"lo\"},\"done\":true,\"eval_count\":2}\n";
        let split = [&body[..10], &body[10..50], &body[50..]];
        let chunks: Vec<_> = relay_ollama(upstream(&split), opts()).collect().await;
        let out: Vec<u8> = chunks.into_iter().flat_map(|c| c.expect("chunk")).collect();
        assert_eq!(String::from_utf8(out).expect("utf8"), body);
    }

    #[tokio::test]
    async fn ollama_trailing_partial_line_is_flushed() {
        let chunks: Vec<_> = relay_ollama(upstream(&["{\"models\":", "[]}"]), opts())
            .collect()
            .await;
        let out: Vec<u8> = chunks.into_iter().flat_map(|c| c.expect("chunk")).collect();
        assert_eq!(out, b"{\"models\":[]}");
    }

    #[tokio::test]
    async fn openai_stream_with_usage_yields_stats_on_done() {
        let parts = [
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel",
            "lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":25,\"total_tokens\":35}}\n\n",
            "data: [DONE]\n\n",
        ];
        let records = collect(relay_openai(upstream(&parts), Some("m.gguf".into()), opts())).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["message"]["content"], "Hello");
        assert_eq!(records[0]["done"], false);

        let last = &records[1];
        assert_eq!(last["done"], true);
        assert_eq!(last["eval_count"], 25);
        assert_eq!(last["prompt_eval_count"], 10);
        assert!(last["eval_duration"].as_u64().expect("duration") > 0);
        assert_eq!(last["done_reason"], "stop");
    }

    #[tokio::test]
    async fn openai_reasoning_then_content() {
        let parts = [
            "data: {\"choices\":[{\"delta\":{\"content\":\"\",\"reasoning_content\":\"think\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"answer\"}}]}\n",
            "data: [DONE]\n",
        ];
        let records = collect(relay_openai(upstream(&parts), None, opts())).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["message"]["thinking"], "think");
        assert_eq!(records[0]["message"]["content"], "");
        assert_eq!(records[1]["message"]["content"], "answer");
        assert!(records[1]["message"].get("thinking").is_none());
        assert_eq!(records[1]["done"], false);
        assert_eq!(records[2]["done"], true);
        assert!(records[2].get("eval_count").is_none());
    }

    #[tokio::test]
    async fn openai_missing_done_still_terminates_once() {
        let parts = ["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}"];
        let records = collect(relay_openai(upstream(&parts), None, opts())).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().filter(|r| r["done"] == true).count(), 1);
    }

    #[tokio::test]
    async fn idle_upstream_times_out() {
        let pending = stream::pending::<Item>();
        let opts = RelayOptions::new(Duration::from_millis(20), "idle");
        let mut relay = relay_openai(pending, None, opts);
        let first = relay.next().await.expect("item");
        assert!(matches!(first, Err(ProviderError::StreamIdle(_))));
    }

    #[tokio::test]
    async fn cancelled_relay_stops_reading() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let opts = opts().with_cancel(cancel);
        let records = collect(relay_openai(stream::pending::<Item>(), None, opts)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["done"], true);
    }

    #[test]
    fn inline_think_segments_do_not_start_eval_clock() {
        let start = Instant::now();
        let mut state = OpenAiRelayState::new(start);
        assert!(!state.has_visible_content("<think>pondering"));
        assert!(!state.has_visible_content("still"));
        assert!(state.has_visible_content("done</think>Answer"));
        assert!(!state.has_visible_content("<think>x</think>  "));
    }

    #[test]
    fn stats_never_report_zero_duration() {
        let now = Instant::now();
        let mut state = OpenAiRelayState::new(now);
        let chunk: OpenAiChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":2}}"#,
        )
        .expect("chunk");
        state.observe(&chunk, now);
        let stats = state.stats(now);
        assert_eq!(stats.eval_duration, Some(1));
        assert_eq!(stats.eval_count, Some(2));
    }
}
