use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{body::Bytes, http::HeaderMap, routing::post, Router};
use futures::StreamExt;
use reqwest::{Client, Method};
use serde_json::{json, Value};

use ollamabro_providers::{
    LlamaCppBackend, LocalTarget, OllamaBackend, OllamaConfig, OllamaForward, OllamaPayload,
    OllamaRoute, RelayOptions, RelayStream,
};

type Captured = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

async fn spawn(app: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    port
}

async fn drain(body: RelayStream) -> String {
    let chunks: Vec<_> = body.collect().await;
    let bytes: Vec<u8> = chunks
        .into_iter()
        .flat_map(|c| c.expect("chunk"))
        .collect();
    String::from_utf8(bytes).expect("utf8")
}

fn opts() -> RelayOptions {
    RelayOptions::new(Duration::from_secs(5), "it")
}

#[tokio::test]
async fn ollama_chat_is_forwarded_streaming_without_flags() {
    let captured: Captured = Arc::default();
    let sink = captured.clone();
    let app = Router::new().route(
        "/api/chat",
        post(move |headers: HeaderMap, body: Bytes| {
            let sink = sink.clone();
            async move {
                let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                sink.lock().expect("lock").push((headers, value));
                "{\"message\":{\"content\":\"hi\"},\"done\":false}\n{\"done\":true,\"eval_count\":3}\n"
            }
        }),
    );
    let port = spawn(app).await;

    let backend = OllamaBackend::new(
        Client::new(),
        OllamaConfig {
            base_url: format!("http://127.0.0.1:{port}"),
            ..OllamaConfig::default()
        },
    );
    let body = serde_json::to_vec(&json!({
        "model": "llama3",
        "messages": [{"role": "user", "content": "hello"}],
        "_webSearch": false,
        "_deepResearch": false
    }))
    .expect("body");
    let forward = OllamaForward {
        route: OllamaRoute::Chat,
        method: Method::POST,
        payload: OllamaPayload::from_body(OllamaRoute::Chat, body),
        content_type: Some("application/json".into()),
        accept: None,
        user_agent: None,
    };

    let resp = backend.forward(forward, opts()).await.expect("forward");
    assert!(resp.status.is_success());
    let text = drain(resp.body).await;
    assert_eq!(text.lines().count(), 2);

    let seen = captured.lock().expect("lock");
    let (headers, sent) = &seen[0];
    assert_eq!(sent["stream"], json!(true));
    assert!(sent.get("_webSearch").is_none());
    assert!(sent.get("_deepResearch").is_none());
    assert_eq!(
        headers.get("user-agent").and_then(|v| v.to_str().ok()),
        Some("OllamaBroProxy/1.0")
    );
}

#[tokio::test]
async fn unreachable_ollama_is_reported() {
    let backend = OllamaBackend::new(
        Client::new(),
        OllamaConfig {
            base_url: "http://127.0.0.1:1".into(),
            ..OllamaConfig::default()
        },
    );
    let forward = OllamaForward {
        route: OllamaRoute::Tags,
        method: Method::GET,
        payload: OllamaPayload::Empty,
        content_type: None,
        accept: None,
        user_agent: None,
    };
    let err = backend.forward(forward, opts()).await.err().expect("error");
    assert_eq!(err.code(), "UPSTREAM_UNREACHABLE");
}

#[tokio::test]
async fn llamacpp_chat_translates_and_normalizes() {
    let captured: Captured = Arc::default();
    let sink = captured.clone();
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |headers: HeaderMap, body: Bytes| {
            let sink = sink.clone();
            async move {
                let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                sink.lock().expect("lock").push((headers, value));
                concat!(
                    "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"plan\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Paris\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":25,\"total_tokens\":35}}\n\n",
                    "data: [DONE]\n\n"
                )
            }
        }),
    );
    let port = spawn(app).await;

    let backend = LlamaCppBackend::new(Client::new(), Duration::from_secs(5));
    let req = serde_json::from_value(json!({
        "model": "whatever",
        "messages": [{"role": "user", "content": "capital of France?"}],
        "options": {"num_predict": 64},
        "_deepResearch": true
    }))
    .expect("request");
    let target = LocalTarget {
        port,
        model_name: "mistral.gguf".into(),
    };

    let stream = backend.chat(Ok(target), &req, opts()).await.expect("chat");
    let text = drain(stream).await;
    let records: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).expect("line"))
        .collect();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["message"]["thinking"], "plan");
    assert_eq!(records[1]["message"]["content"], "Paris");
    assert_eq!(records[2]["done"], true);
    assert_eq!(records[2]["eval_count"], 25);
    assert_eq!(records[2]["prompt_eval_count"], 10);

    let seen = captured.lock().expect("lock");
    let sent = &seen[0].1;
    assert_eq!(sent["model"], "mistral.gguf");
    assert_eq!(sent["max_tokens"], 64);
    assert_eq!(sent["stream_options"]["include_usage"], true);
    assert!(sent.get("_deepResearch").is_none());
}

#[tokio::test]
async fn llamacpp_error_status_surfaces_detail() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "{\"error\":{\"message\":\"Loading model\"}}",
            )
        }),
    );
    let port = spawn(app).await;
    let backend = LlamaCppBackend::new(Client::new(), Duration::from_secs(5));
    let req = serde_json::from_value(json!({"messages": []})).expect("request");
    let target = LocalTarget {
        port,
        model_name: "m.gguf".into(),
    };
    let err = backend
        .chat(Ok(target), &req, opts())
        .await
        .err()
        .expect("error");
    assert_eq!(err.to_string(), "upstream returned 503: Loading model");
}
