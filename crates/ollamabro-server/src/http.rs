use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::Level;
use uuid::Uuid;

use ollamabro_observability::{emit_event, ObservabilityEvent, ProcessKind};
use ollamabro_providers::{
    BackendKind, LocalTarget, OllamaForward, OllamaPayload, OllamaRoute, ProviderError,
    RelayOptions, RelayStream,
};
use ollamabro_runtime::{llmfit, BackendSnapshot, LlamaServerConfigPatch};
use ollamabro_tools::EnrichmentSummary;
use ollamabro_types::ChatRequest;

use crate::config::AllowedOrigins;
use crate::{AppState, GatewayError};

/// Chat bodies carry base64 images, so the default 2 MB limit is too small.
pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;
/// Gap between answering `/api/shutdown` and closing the listener.
pub const SHUTDOWN_DELAY: Duration = Duration::from_millis(200);

const NDJSON: &str = "application/x-ndjson";
const STATUS_LOG_LINES: usize = 40;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let token = state.shutdown.clone();
    let backend = state.backend.clone();
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token))
        .await;

    // The listener is closed; make sure llama-server does not outlive us.
    backend.shutdown().await;
    emit_event(
        Level::INFO,
        ProcessKind::Gateway,
        ObservabilityEvent {
            status: Some("stopped"),
            ..ObservabilityEvent::new("gateway.shutdown.complete", "http")
        },
    );
    result?;
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl-C, shutting down"),
        _ = token.cancelled() => tracing::info!("shutdown requested"),
    }
    // Ends in-flight relays so graceful shutdown does not wait on them.
    token.cancel();
}

pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(health))
        .route("/proxy/{*path}", any(proxy))
        .route("/api/llamacpp/chat", post(llamacpp_chat))
        .route("/api/llamacpp/status", get(llamacpp_status))
        .route(
            "/api/llamacpp/config",
            get(llamacpp_config).post(llamacpp_update_config),
        )
        .route("/api/llamacpp/models", get(llamacpp_models))
        .route("/api/llamacpp/load", post(llamacpp_load))
        .route("/api/llamacpp/stop", post(llamacpp_stop))
        .route(
            "/api/llamacpp/delete",
            post(llamacpp_delete).delete(llamacpp_delete),
        )
        .route("/api/llmfit/recommend", get(llmfit_recommend))
        .route("/api/shutdown", post(shutdown))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), origin_gate))
        .with_state(state)
}

fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
    let allow_origin = match origins {
        AllowedOrigins::Any => AllowOrigin::any(),
        AllowedOrigins::List(list) => AllowOrigin::list(
            list.iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        ),
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Requests without an `Origin` header (native host, curl) pass; browser
/// requests must come from an allowed origin.
async fn origin_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .map(|v| v.to_str().unwrap_or_default().to_string());
    match origin {
        Some(origin) if !state.config.allowed_origins.allows(&origin) => {
            tracing::warn!(
                origin = %origin,
                method = %request.method(),
                path = %request.uri().path(),
                "blocked request from disallowed origin"
            );
            GatewayError::OriginNotAllowed(origin).into_response()
        }
        _ => next.run(request).await,
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.backend.snapshot().await;
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "timeMs": crate::now_ms(),
        "ollamaUrl": state.ollama.base_url(),
        "backend": {
            "status": backend.status,
            "model": backend.model,
            "port": backend.port,
        },
    }))
}

async fn proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request_id = Uuid::new_v4().to_string();
    let route = OllamaRoute::resolve(&path)?;

    let content_type = header_string(&headers, header::CONTENT_TYPE);
    let mut payload = OllamaPayload::from_body(route, body.to_vec());

    let mut model = None;
    if let Some(chat) = payload.chat_mut() {
        let summary = state.enricher.enrich(chat, &request_id).await;
        log_enrichment(&request_id, BackendKind::Ollama, &chat.model, &summary);
        model = Some(chat.model.clone());
    }

    emit_event(
        Level::INFO,
        ProcessKind::Gateway,
        ObservabilityEvent {
            request_id: Some(&request_id),
            backend: Some(BackendKind::Ollama.as_str()),
            model: model.as_deref(),
            detail: Some(route.path()),
            ..ObservabilityEvent::new("gateway.proxy.start", "http")
        },
    );

    let forward = OllamaForward {
        route,
        method,
        payload,
        content_type,
        accept: header_string(&headers, header::ACCEPT),
        user_agent: header_string(&headers, header::USER_AGENT),
    };
    let relay = RelayOptions::new(state.ollama.timeout_for(route), request_id)
        .with_cancel(state.shutdown.child_token());
    let upstream = state.ollama.forward(forward, relay).await?;
    Ok(stream_response(
        upstream.status,
        upstream.content_type.as_deref(),
        upstream.body,
    ))
}

async fn llamacpp_chat(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request_id = Uuid::new_v4().to_string();
    let mut request: ChatRequest = parse_json(&body)?;
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    // Refuse before spending time on lookups.
    if let Err(status) = state.backend.ready_target().await {
        return Err(ProviderError::BackendNotReady(status.as_str().to_string()).into());
    }

    let summary = state.enricher.enrich(&mut request, &request_id).await;
    log_enrichment(&request_id, BackendKind::LlamaCpp, &request.model, &summary);

    let target = state
        .backend
        .ready_target()
        .await
        .map(|ready| LocalTarget {
            port: ready.port,
            model_name: ready.model_name,
        })
        .map_err(|status| status.as_str().to_string());

    emit_event(
        Level::INFO,
        ProcessKind::Gateway,
        ObservabilityEvent {
            request_id: Some(&request_id),
            backend: Some(BackendKind::LlamaCpp.as_str()),
            model: target.as_ref().ok().map(|t| t.model_name.as_str()),
            ..ObservabilityEvent::new("gateway.chat.start", "http")
        },
    );

    let relay = RelayOptions::new(state.config.llamacpp_timeout, request_id)
        .with_cancel(state.shutdown.child_token());
    let stream = state.llamacpp.chat(target, &request, relay).await?;
    Ok(stream_response(StatusCode::OK, Some(NDJSON), stream))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    #[serde(flatten)]
    backend: BackendSnapshot,
    recent_logs: String,
}

async fn llamacpp_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        backend: state.backend.snapshot().await,
        recent_logs: state.backend.recent_logs(STATUS_LOG_LINES),
    })
}

async fn llamacpp_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.backend.config().await)
}

async fn llamacpp_update_config(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    let patch: LlamaServerConfigPatch = parse_json(&body)?;
    let config = state.backend.update_config(patch).await?;
    Ok(Json(json!({ "status": "updated", "config": config })))
}

async fn llamacpp_models(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.backend.config().await;
    let models = state.backend.list_models().await;
    Json(json!({ "models": models, "modelDirs": config.model_dirs }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelPathInput {
    #[serde(alias = "path")]
    model_path: String,
}

impl ModelPathInput {
    fn path(&self) -> Result<PathBuf, GatewayError> {
        let trimmed = self.model_path.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "modelPath is required".to_string(),
            ));
        }
        Ok(PathBuf::from(trimmed))
    }
}

async fn llamacpp_load(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    let input: ModelPathInput = parse_json(&body)?;
    let path = input.path()?;
    let loaded = state.backend.load(&path).await?;
    Ok(Json(json!({
        "status": "ready",
        "model": loaded.model,
        "modelPath": loaded.model_path,
        "port": loaded.port,
    })))
}

async fn llamacpp_stop(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.backend.stop().await;
    Json(json!({ "status": snapshot.status }))
}

async fn llamacpp_delete(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    let input: ModelPathInput = parse_json(&body)?;
    let path = input.path()?;
    let deleted = state.backend.delete_model(&path).await?;
    Ok(Json(json!({
        "deleted": true,
        "path": deleted.display().to_string(),
    })))
}

async fn llmfit_recommend(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let report = llmfit::recommend(&state.config.llmfit_path, state.config.llmfit_timeout).await?;
    Ok(Json(report))
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    emit_event(
        Level::INFO,
        ProcessKind::Gateway,
        ObservabilityEvent {
            status: Some("shutting_down"),
            ..ObservabilityEvent::new("gateway.shutdown.requested", "http")
        },
    );
    let token = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_DELAY).await;
        token.cancel();
    });
    Json(json!({ "status": "shutting_down" }))
}

fn stream_response(status: StatusCode, content_type: Option<&str>, body: RelayStream) -> Response {
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    let content_type = content_type
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or(HeaderValue::from_static(NDJSON));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    response
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// An empty body reads as `{}`.
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, GatewayError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}

fn log_enrichment(
    request_id: &str,
    backend: BackendKind,
    model: &str,
    summary: &EnrichmentSummary,
) {
    if !summary.injected && summary.failures == 0 {
        return;
    }
    let detail = format!(
        "pages={} searched={} researched={} failures={}",
        summary.pages, summary.searched, summary.researched, summary.failures
    );
    emit_event(
        Level::INFO,
        ProcessKind::Gateway,
        ObservabilityEvent {
            request_id: Some(request_id),
            backend: Some(backend.as_str()),
            model: Some(model),
            status: Some(if summary.injected { "injected" } else { "skipped" }),
            detail: Some(&detail),
            ..ObservabilityEvent::new("gateway.enrichment", "enrichment")
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::to_bytes;
    use axum::http::Request;
    use ollamabro_runtime::LlamaServerConfig;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use crate::config::{GatewayConfig, EXTENSION_ORIGIN};

    type Captured = Arc<Mutex<Option<Value>>>;

    fn test_state(ollama_url: &str) -> AppState {
        AppState::new(
            GatewayConfig {
                ollama_url: ollama_url.to_string(),
                ..GatewayConfig::default()
            },
            LlamaServerConfig::default(),
        )
    }

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        listener.local_addr().expect("addr").port()
    }

    async fn mock_chat(State(captured): State<Captured>, Json(body): Json<Value>) -> Response {
        *captured.lock().await = Some(body);
        (
            [(header::CONTENT_TYPE, NDJSON)],
            "{\"message\":{\"role\":\"assistant\",\"content\":\"hi\"},\"done\":false}\n{\"done\":true,\"eval_count\":1}\n",
        )
            .into_response()
    }

    async fn spawn_mock_ollama(captured: Captured) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new()
            .route("/api/chat", post(mock_chat))
            .with_state(captured);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let resp = app.oneshot(req).await.expect("response");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        (status, headers, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn error_code(body: &Bytes) -> String {
        let payload: Value = serde_json::from_slice(body).expect("json");
        payload["code"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn health_reports_idle_backend() {
        let app = app_router(test_state("http://127.0.0.1:11434"));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["healthy"], true);
        assert_eq!(payload["backend"]["status"], "idle");
    }

    #[tokio::test]
    async fn disallowed_origin_is_rejected() {
        let app = app_router(test_state("http://127.0.0.1:11434"));
        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "https://evil.test")
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_code(&body), "ORIGIN_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn allowed_origin_gets_cors_headers() {
        let app = app_router(test_state("http://127.0.0.1:11434"));
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/llamacpp/status")
            .header(header::ORIGIN, EXTENSION_ORIGIN)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .expect("request");
        let (status, headers, _) = send(app, req).await;
        assert!(status.is_success());
        assert_eq!(
            headers
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some(EXTENSION_ORIGIN)
        );
    }

    #[tokio::test]
    async fn proxy_rejects_paths_outside_allow_list() {
        let app = app_router(test_state("http://127.0.0.1:11434"));
        let req = Request::builder()
            .uri("/proxy/api/ps")
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_code(&body), "PATH_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn proxy_chat_forces_streaming_and_strips_flags() {
        let captured: Captured = Arc::new(Mutex::new(None));
        let url = spawn_mock_ollama(captured.clone()).await;
        let app = app_router(test_state(&url));

        let req = post_json(
            "/proxy/api/chat",
            json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "Say hello"}],
                "stream": false,
                "_webSearch": false,
                "_deepResearch": "false"
            }),
        );
        let (status, headers, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some(NDJSON)
        );
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"done\":true"));

        let sent = captured.lock().await.clone().expect("captured body");
        assert_eq!(sent["stream"], true);
        assert!(sent.get("_webSearch").is_none());
        assert!(sent.get("_deepResearch").is_none());
        assert_eq!(sent["model"], "llama3");
    }

    #[tokio::test]
    async fn proxy_chat_without_content_type_is_still_treated_as_json() {
        let captured: Captured = Arc::new(Mutex::new(None));
        let url = spawn_mock_ollama(captured.clone()).await;
        let app = app_router(test_state(&url));

        let req = Request::builder()
            .method("POST")
            .uri("/proxy/api/chat")
            .body(Body::from(
                json!({
                    "model": "llama3",
                    "messages": [{"role": "user", "content": "Say hello"}],
                    "stream": false,
                    "_webSearch": true,
                    "_deepResearch": true
                })
                .to_string(),
            ))
            .expect("request");
        let (status, _, _) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);

        let sent = captured.lock().await.clone().expect("captured body");
        assert_eq!(sent["stream"], true);
        assert!(sent.get("_webSearch").is_none());
        assert!(sent.get("_deepResearch").is_none());
    }

    #[tokio::test]
    async fn proxy_reports_unreachable_ollama() {
        let port = unused_port().await;
        let app = app_router(test_state(&format!("http://127.0.0.1:{port}")));
        let req = Request::builder()
            .uri("/proxy/api/tags")
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(error_code(&body), "UPSTREAM_UNREACHABLE");
    }

    #[tokio::test]
    async fn llamacpp_chat_requires_ready_backend() {
        let app = app_router(test_state("http://127.0.0.1:11434"));
        let req = post_json(
            "/api/llamacpp/chat",
            json!({"model": "x", "messages": [{"role": "user", "content": "hi"}]}),
        );
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(&body), "BACKEND_NOT_READY");
    }

    #[tokio::test]
    async fn llamacpp_chat_rejects_bad_bodies() {
        let state = test_state("http://127.0.0.1:11434");
        let req = Request::builder()
            .method("POST")
            .uri("/api/llamacpp/chat")
            .body(Body::from("{not json"))
            .expect("request");
        let (status, _, body) = send(app_router(state.clone()), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "INVALID_REQUEST");

        let req = post_json("/api/llamacpp/chat", json!({"model": "x", "messages": []}));
        let (status, _, _) = send(app_router(state), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn load_missing_model_is_not_found() {
        let app = app_router(test_state("http://127.0.0.1:11434"));
        let req = post_json(
            "/api/llamacpp/load",
            json!({"modelPath": "/definitely/not/here.gguf"}),
        );
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&body), "MODEL_NOT_FOUND");
    }

    #[tokio::test]
    async fn config_update_is_reflected_in_status() {
        let state = test_state("http://127.0.0.1:11434");
        let req = post_json(
            "/api/llamacpp/config",
            json!({"port": 9191, "ctxSize": 8192}),
        );
        let (status, _, body) = send(app_router(state.clone()), req).await;
        assert_eq!(status, StatusCode::OK);
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["config"]["port"], 9191);

        let req = Request::builder()
            .uri("/api/llamacpp/status")
            .body(Body::empty())
            .expect("request");
        let (_, _, body) = send(app_router(state.clone()), req).await;
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "idle");
        assert_eq!(payload["port"], 9191);
        assert_eq!(payload["config"]["ctxSize"], 8192);

        let req = post_json("/api/llamacpp/config", json!({"port": 0}));
        let (status, _, body) = send(app_router(state), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn models_are_listed_and_deleted_inside_dirs_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models = dir.path().join("models");
        std::fs::create_dir(&models).expect("mkdir");
        std::fs::write(models.join("tiny.gguf"), b"GGUF").expect("write");
        let outside = dir.path().join("outside.gguf");
        std::fs::write(&outside, b"GGUF").expect("write");

        let state = test_state("http://127.0.0.1:11434");
        let req = post_json(
            "/api/llamacpp/config",
            json!({"modelDirs": [models.display().to_string()]}),
        );
        let (status, _, _) = send(app_router(state.clone()), req).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::builder()
            .uri("/api/llamacpp/models")
            .body(Body::empty())
            .expect("request");
        let (_, _, body) = send(app_router(state.clone()), req).await;
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["models"][0]["name"], "tiny.gguf");
        assert_eq!(payload["models"][0]["size"], 4);

        let req = post_json(
            "/api/llamacpp/delete",
            json!({"modelPath": outside.display().to_string()}),
        );
        let (status, _, body) = send(app_router(state.clone()), req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_code(&body), "PATH_OUTSIDE_MODEL_DIRS");
        assert!(outside.exists());

        let req = post_json(
            "/api/llamacpp/delete",
            json!({"modelPath": models.join("tiny.gguf").display().to_string()}),
        );
        let (status, _, body) = send(app_router(state), req).await;
        assert_eq!(status, StatusCode::OK);
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["deleted"], true);
        assert!(!models.join("tiny.gguf").exists());
    }

    #[tokio::test]
    async fn stop_when_idle_reports_idle() {
        let app = app_router(test_state("http://127.0.0.1:11434"));
        let req = post_json("/api/llamacpp/stop", json!({}));
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "idle");
    }

    #[tokio::test]
    async fn shutdown_answers_then_cancels() {
        let state = test_state("http://127.0.0.1:11434");
        let req = post_json("/api/shutdown", json!({}));
        let (status, _, body) = send(app_router(state.clone()), req).await;
        assert_eq!(status, StatusCode::OK);
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "shutting_down");
        assert!(!state.shutdown.is_cancelled());

        tokio::time::timeout(Duration::from_secs(2), state.shutdown.cancelled())
            .await
            .expect("token cancelled");
    }
}
