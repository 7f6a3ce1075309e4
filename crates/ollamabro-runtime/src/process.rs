use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use ollamabro_observability::{emit_event, ObservabilityEvent, ProcessKind};

use crate::config::{LlamaServerConfig, LlamaServerConfigPatch};
use crate::error::{BackendProcessError, Result};
use crate::output::{OutputStream, OutputTail};
use crate::models::{is_model_file, resolve_within, same_file, scan_model_dirs, ModelFile};

const OUTPUT_TAIL_LINES: usize = 500;
const FAILURE_TAIL_LINES: usize = 40;
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Error,
}

impl BackendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendStatus::Idle => "idle",
            BackendStatus::Loading => "loading",
            BackendStatus::Ready => "ready",
            BackendStatus::Error => "error",
        }
    }
}

/// Read-only view of the process state for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    pub status: BackendStatus,
    pub model: Option<String>,
    pub model_path: Option<String>,
    pub pid: Option<u32>,
    pub port: u16,
    pub config: LlamaServerConfig,
    pub last_error: Option<String>,
    pub started_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedModel {
    pub model: String,
    pub model_path: String,
    pub port: u16,
}

/// The one thing chat needs from a ready backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyBackend {
    pub port: u16,
    pub model_name: String,
}

#[derive(Debug, Default)]
struct ProcessState {
    status: BackendStatus,
    model_path: Option<PathBuf>,
    model_name: Option<String>,
    pid: Option<u32>,
    port: Option<u16>,
    last_error: Option<String>,
    started_at_ms: Option<i64>,
}

impl ProcessState {
    fn clear_model(&mut self, status: BackendStatus) {
        self.status = status;
        self.model_path = None;
        self.model_name = None;
        self.pid = None;
        self.port = None;
        self.started_at_ms = None;
    }
}

struct RunningProcess {
    pid: Option<u32>,
    stop_tx: oneshot::Sender<()>,
    exit_rx: watch::Receiver<Option<String>>,
}

struct Inner {
    lifecycle_lock: Mutex<()>,
    state: RwLock<ProcessState>,
    config: RwLock<LlamaServerConfig>,
    running: Mutex<Option<RunningProcess>>,
    pending_load: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    output: OutputTail,
    client: reqwest::Client,
}

/// Owns the single llama-server child process.
///
/// `load`, `stop` and `delete_model` hold the lifecycle lock for their whole
/// duration, so two loads can never race on the port. `stop` first cancels a
/// load that is still waiting for readiness. Status reads only touch
/// in-memory state.
#[derive(Clone)]
pub struct BackendProcessManager {
    inner: Arc<Inner>,
}

impl BackendProcessManager {
    pub fn new(config: LlamaServerConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: LlamaServerConfig, client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle_lock: Mutex::new(()),
                state: RwLock::new(ProcessState::default()),
                config: RwLock::new(config),
                running: Mutex::new(None),
                pending_load: Mutex::new(None),
                generation: AtomicU64::new(0),
                output: OutputTail::new(OUTPUT_TAIL_LINES),
                client,
            }),
        }
    }

    pub async fn snapshot(&self) -> BackendSnapshot {
        let config = self.inner.config.read().await.clone();
        let state = self.inner.state.read().await;
        BackendSnapshot {
            status: state.status,
            model: state.model_name.clone(),
            model_path: state.model_path.as_ref().map(|p| p.display().to_string()),
            pid: state.pid,
            port: state.port.unwrap_or(config.port),
            config,
            last_error: state.last_error.clone(),
            started_at_ms: state.started_at_ms,
        }
    }

    pub async fn status(&self) -> BackendStatus {
        self.inner.state.read().await.status
    }

    /// Port and model name when a model is ready, otherwise the current
    /// status.
    pub async fn ready_target(&self) -> std::result::Result<ReadyBackend, BackendStatus> {
        let state = self.inner.state.read().await;
        match (state.status, state.port, state.model_name.as_ref()) {
            (BackendStatus::Ready, Some(port), Some(name)) => Ok(ReadyBackend {
                port,
                model_name: name.clone(),
            }),
            (status, _, _) => Err(status),
        }
    }

    pub fn recent_logs(&self, last_n: usize) -> String {
        self.inner.output.tail_text(last_n)
    }

    pub async fn config(&self) -> LlamaServerConfig {
        self.inner.config.read().await.clone()
    }

    /// In-memory only; a running process keeps its settings until the next
    /// load.
    pub async fn update_config(&self, patch: LlamaServerConfigPatch) -> Result<LlamaServerConfig> {
        let mut config = self.inner.config.write().await;
        let next = config.patched(patch)?;
        *config = next.clone();
        tracing::info!(
            executable = %next.executable,
            model_dirs = next.model_dirs.len(),
            gpu_layers = next.gpu_layers,
            port = next.port,
            ctx_size = next.ctx_size,
            "llama-server config updated"
        );
        Ok(next)
    }

    pub async fn list_models(&self) -> Vec<ModelFile> {
        let dirs = self.inner.config.read().await.model_dirs.clone();
        tokio::task::spawn_blocking(move || scan_model_dirs(&dirs))
            .await
            .unwrap_or_default()
    }

    pub async fn load(&self, model_path: &Path) -> Result<LoadedModel> {
        let _lifecycle_guard = self.inner.lifecycle_lock.lock().await;

        match tokio::fs::metadata(model_path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(BackendProcessError::ModelNotFound(model_path.to_path_buf())),
        }

        let cancel = CancellationToken::new();
        *self.inner.pending_load.lock().await = Some(cancel.clone());

        self.teardown_locked().await;
        self.inner.output.clear();

        let config = self.inner.config.read().await.clone();
        let model_name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| model_path.display().to_string());
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut state = self.inner.state.write().await;
            state.status = BackendStatus::Loading;
            state.model_path = Some(model_path.to_path_buf());
            state.model_name = Some(model_name.clone());
            state.port = Some(config.port);
            state.pid = None;
            state.last_error = None;
            state.started_at_ms = None;
        }

        tracing::info!(
            model = %model_name,
            port = config.port,
            ctx_size = config.ctx_size,
            gpu_layers = config.gpu_layers,
            "starting llama-server"
        );

        let mut child = match spawn_server(&config, model_path) {
            Ok(child) => child,
            Err(err) => {
                let err = BackendProcessError::Spawn(format!("{}: {err}", config.executable));
                self.inner.pending_load.lock().await.take();
                self.fail_load(&err).await;
                return Err(err);
            }
        };
        let pid = child.id();
        self.attach_output(&mut child);

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(
            self.inner.clone(),
            child,
            generation,
            config.teardown_grace,
            stop_rx,
            exit_tx,
        ));
        {
            let mut running = self.inner.running.lock().await;
            *running = Some(RunningProcess {
                pid,
                stop_tx,
                exit_rx: exit_rx.clone(),
            });
        }
        self.inner.state.write().await.pid = pid;

        let detail = format!(
            "port={} timeout_ms={}",
            config.port,
            config.ready_timeout.as_millis()
        );
        emit_event(
            Level::INFO,
            ProcessKind::LlamaServer,
            ObservabilityEvent {
                status: Some("start"),
                model: Some(&model_name),
                detail: Some(&detail),
                ..ObservabilityEvent::new("llama.wait.start", "backend_process")
            },
        );

        let waited = tokio::select! {
            _ = cancel.cancelled() => Err(BackendProcessError::LoadCancelled),
            result = self.wait_for_ready(&config, exit_rx) => result,
        };
        self.inner.pending_load.lock().await.take();

        match waited {
            Ok(elapsed) => {
                {
                    let mut state = self.inner.state.write().await;
                    state.status = BackendStatus::Ready;
                    state.started_at_ms = Some(chrono::Utc::now().timestamp_millis());
                }
                let detail = format!("elapsed_ms={}", elapsed.as_millis());
                emit_event(
                    Level::INFO,
                    ProcessKind::LlamaServer,
                    ObservabilityEvent {
                        status: Some("ready"),
                        model: Some(&model_name),
                        detail: Some(&detail),
                        ..ObservabilityEvent::new("llama.wait.ready", "backend_process")
                    },
                );
                Ok(LoadedModel {
                    model: model_name,
                    model_path: model_path.display().to_string(),
                    port: config.port,
                })
            }
            Err(BackendProcessError::LoadCancelled) => {
                self.teardown_locked().await;
                tracing::info!(model = %model_name, "llama-server load cancelled");
                Err(BackendProcessError::LoadCancelled)
            }
            Err(err) => {
                self.teardown_locked().await;
                self.fail_load(&err).await;
                Err(err)
            }
        }
    }

    async fn cancel_pending_load(&self) {
        if let Some(cancel) = self.inner.pending_load.lock().await.as_ref() {
            cancel.cancel();
        }
    }

    pub async fn stop(&self) -> BackendSnapshot {
        self.cancel_pending_load().await;
        {
            let _lifecycle_guard = self.inner.lifecycle_lock.lock().await;
            self.teardown_locked().await;
        }
        self.snapshot().await
    }

    /// Stops any running process; used on gateway exit.
    pub async fn shutdown(&self) {
        self.cancel_pending_load().await;
        let _lifecycle_guard = self.inner.lifecycle_lock.lock().await;
        self.teardown_locked().await;
    }

    /// Deletes a model file inside a configured directory. The loaded model
    /// cannot be deleted.
    pub async fn delete_model(&self, model_path: &Path) -> Result<PathBuf> {
        let _lifecycle_guard = self.inner.lifecycle_lock.lock().await;
        let dirs = self.inner.config.read().await.model_dirs.clone();
        let resolved = resolve_within(model_path, &dirs)?;
        if !is_model_file(&resolved) {
            return Err(BackendProcessError::NotAModelFile(model_path.to_path_buf()));
        }

        let loaded = self.inner.state.read().await.model_path.clone();
        if let Some(loaded) = loaded {
            if same_file(&loaded, &resolved) {
                return Err(BackendProcessError::ModelInUse(model_path.to_path_buf()));
            }
        }

        tokio::fs::remove_file(&resolved).await?;
        tracing::info!(path = %resolved.display(), "deleted model file");
        Ok(resolved)
    }

    async fn fail_load(&self, err: &BackendProcessError) {
        let message = err.to_string();
        {
            let mut state = self.inner.state.write().await;
            state.clear_model(BackendStatus::Error);
            state.last_error = Some(message.clone());
        }
        emit_event(
            Level::ERROR,
            ProcessKind::LlamaServer,
            ObservabilityEvent {
                status: Some("failed"),
                error_code: Some(err.code()),
                detail: Some(&message),
                ..ObservabilityEvent::new("llama.load.failed", "backend_process")
            },
        );
    }

    /// Stops the current child, if any, and resets state to idle. Caller
    /// must hold the lifecycle lock.
    async fn teardown_locked(&self) {
        // Invalidate the monitor first so it does not race the reset below.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let running = self.inner.running.lock().await.take();
        if let Some(running) = running {
            let grace = self.inner.config.read().await.teardown_grace;
            tracing::info!(pid = ?running.pid, "stopping llama-server");
            let RunningProcess {
                pid,
                stop_tx,
                mut exit_rx,
            } = running;
            let _ = stop_tx.send(());
            // Monitor escalates SIGTERM -> kill -> force kill, each bounded by
            // the grace period.
            let bound = grace * 4 + Duration::from_secs(2);
            let exited = match tokio::time::timeout(bound, exit_rx.wait_for(|exit| exit.is_some()))
                .await
            {
                Ok(Ok(exit)) => exit.clone(),
                _ => None,
            };
            match exited {
                Some(exit) => tracing::info!(pid = ?pid, exit = %exit, "llama-server stopped"),
                None => tracing::warn!(pid = ?pid, "llama-server did not confirm exit"),
            }
        }
        let mut state = self.inner.state.write().await;
        state.clear_model(BackendStatus::Idle);
    }

    fn attach_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(self.inner.clone(), stdout, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(self.inner.clone(), stderr, OutputStream::Stderr));
        }
    }

    async fn wait_for_ready(
        &self,
        config: &LlamaServerConfig,
        exit_rx: watch::Receiver<Option<String>>,
    ) -> Result<Duration> {
        let start = Instant::now();
        let url = format!("http://127.0.0.1:{}/health", config.port);
        loop {
            let exited = exit_rx.borrow().clone();
            if let Some(status) = exited {
                return Err(BackendProcessError::ExitedEarly {
                    status,
                    logs: self.inner.output.tail_text(FAILURE_TAIL_LINES),
                });
            }
            if self.health_check(&url).await {
                tracing::info!(elapsed = ?start.elapsed(), "llama-server is ready");
                return Ok(start.elapsed());
            }
            if start.elapsed() >= config.ready_timeout {
                emit_event(
                    Level::WARN,
                    ProcessKind::LlamaServer,
                    ObservabilityEvent {
                        status: Some("timeout"),
                        error_code: Some("GATEWAY_TIMEOUT"),
                        ..ObservabilityEvent::new("llama.wait.timeout", "backend_process")
                    },
                );
                return Err(BackendProcessError::ReadyTimeout(config.ready_timeout));
            }
            tokio::time::sleep(config.poll_interval).await;
        }
    }

    async fn health_check(&self, url: &str) -> bool {
        match self
            .inner
            .client
            .get(url)
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

fn spawn_server(config: &LlamaServerConfig, model_path: &Path) -> std::io::Result<Child> {
    let mut cmd = Command::new(&config.executable);

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.arg("--model")
        .arg(model_path)
        .args([
            "--port",
            &config.port.to_string(),
            "--ctx-size",
            &config.ctx_size.to_string(),
            "--n-gpu-layers",
            &config.gpu_layers.to_string(),
            "--host",
            "127.0.0.1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn()
}

async fn drain_output<R>(inner: Arc<Inner>, stream: R, kind: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "ollamabro.llama_server", stream = kind.as_str(), "{line}");
        inner.output.push(kind, line);
    }
}

/// Owns the child until it exits. A stop request escalates through
/// graceful termination; an exit nobody asked for drops a ready backend to
/// idle.
async fn monitor(
    inner: Arc<Inner>,
    mut child: Child,
    generation: u64,
    grace: Duration,
    stop_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<String>>,
) {
    let pid = child.id();
    tokio::select! {
        status = child.wait() => {
            let desc = describe_exit(status);
            tracing::warn!(pid = ?pid, exit = %desc, "llama-server exited");
            handle_unexpected_exit(&inner, generation, &desc).await;
            let _ = exit_tx.send(Some(desc));
        }
        _ = stop_rx => {
            let desc = terminate(&mut child, pid, grace).await;
            let _ = exit_tx.send(Some(desc));
        }
    }
}

async fn handle_unexpected_exit(inner: &Inner, generation: u64, desc: &str) {
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    let mut state = inner.state.write().await;
    // Loading failures are reported by the readiness wait instead.
    if state.status == BackendStatus::Ready {
        state.clear_model(BackendStatus::Idle);
        state.last_error = Some(format!("llama-server exited unexpectedly ({desc})"));
        drop(state);
        inner.running.lock().await.take();
        emit_event(
            Level::WARN,
            ProcessKind::LlamaServer,
            ObservabilityEvent {
                status: Some("idle"),
                detail: Some(desc),
                ..ObservabilityEvent::new("llama.exit.unexpected", "backend_process")
            },
        );
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(err) => format!("wait failed: {err}"),
    }
}

/// SIGTERM, grace, kill, grace, then kill by PID through the OS.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> String {
    if let Ok(Some(status)) = child.try_wait() {
        return status.to_string();
    }

    send_terminate(child, pid);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return describe_exit(status);
    }

    tracing::warn!(pid = ?pid, "llama-server ignored graceful shutdown, killing");
    let _ = child.start_kill();
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return describe_exit(status);
    }

    if let Some(pid) = pid {
        force_kill_pid(pid).await;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => describe_exit(status),
        Err(_) => "unconfirmed".to_string(),
    }
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(pid, error = %err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(windows)]
async fn force_kill_pid(pid: u32) {
    let result = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()
        .await;
    if let Err(err) = result {
        tracing::warn!(pid, error = %err, "taskkill failed");
    }
}

#[cfg(unix)]
async fn force_kill_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(raw), Signal::SIGKILL);
    }
}

#[cfg(not(any(unix, windows)))]
async fn force_kill_pid(_pid: u32) {}
