use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ollamabro_observability::{
    default_logs_dir, emit_event, init_process_logging, redact_text, ObservabilityEvent,
    ProcessKind,
};
use ollamabro_providers::DEFAULT_OLLAMA_URL;
use ollamabro_runtime::{
    parse_model_dirs, BackendProcessManager, LlamaServerConfig, DEFAULT_CTX_SIZE,
    DEFAULT_GPU_LAYERS, DEFAULT_LLAMA_PORT, DEFAULT_LLAMA_SERVER,
};
use ollamabro_server::{ensure_loopback_url, serve, AllowedOrigins, AppState, GatewayConfig};
use ollamabro_tools::{
    is_placeholder_api_key, DEFAULT_READER_URL, DEFAULT_RESEARCH_URL, DEFAULT_SEARCH_URL,
};
use tracing::info;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "ollamabro-gateway")]
#[command(about = "Local gateway between the OllamaBro extension and Ollama / llama.cpp")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", env = "OLLAMABRO_HOST", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, env = "OLLAMABRO_PORT", default_value_t = 3000)]
        port: u16,
        #[arg(long, env = "OLLAMA_API_BASE_URL", default_value = DEFAULT_OLLAMA_URL)]
        ollama_url: String,
        /// Repeatable; `*` allows every origin.
        #[arg(
            long = "allowed-origin",
            env = "OLLAMABRO_ALLOWED_ORIGINS",
            value_delimiter = ','
        )]
        allowed_origins: Vec<String>,
        #[arg(long, env = "TAVILY_API_KEY", hide_env_values = true)]
        tavily_api_key: Option<String>,
        #[arg(long, env = "OLLAMABRO_READER_URL", default_value = DEFAULT_READER_URL)]
        reader_url: String,
        #[arg(long, default_value = DEFAULT_SEARCH_URL)]
        search_url: String,
        #[arg(long, default_value = DEFAULT_RESEARCH_URL)]
        research_url: String,
        #[command(flatten)]
        llama: LlamaArgs,
        #[arg(long, env = "OLLAMABRO_LOGS_DIR")]
        logs_dir: Option<PathBuf>,
    },
    /// Print the model files found in the configured directories.
    Models {
        #[arg(long, env = "LLAMA_MODEL_DIRS")]
        model_dirs: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct LlamaArgs {
    #[arg(long, env = "LLAMA_SERVER_PATH", default_value = DEFAULT_LLAMA_SERVER)]
    llama_server_path: String,
    /// Comma-separated directories holding .gguf files.
    #[arg(long, env = "LLAMA_MODEL_DIRS")]
    model_dirs: Option<String>,
    #[arg(long, default_value_t = DEFAULT_GPU_LAYERS)]
    gpu_layers: u32,
    #[arg(long, default_value_t = DEFAULT_LLAMA_PORT)]
    llama_port: u16,
    #[arg(long, default_value_t = DEFAULT_CTX_SIZE)]
    ctx_size: u32,
}

impl LlamaArgs {
    fn into_config(self) -> LlamaServerConfig {
        LlamaServerConfig {
            executable: self.llama_server_path,
            model_dirs: self
                .model_dirs
                .as_deref()
                .map(parse_model_dirs)
                .unwrap_or_default(),
            gpu_layers: self.gpu_layers,
            port: self.llama_port,
            ctx_size: self.ctx_size,
            ..LlamaServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            ollama_url,
            allowed_origins,
            tavily_api_key,
            reader_url,
            search_url,
            research_url,
            llama,
            logs_dir,
        } => {
            let logs_dir = logs_dir.unwrap_or_else(default_logs_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Gateway, &logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Gateway,
                ObservabilityEvent {
                    status: Some("ok"),
                    detail: Some("gateway jsonl logging initialized"),
                    ..ObservabilityEvent::new("logging.initialized", "gateway.main")
                },
            );
            info!("gateway logging initialized: {:?}", log_info);

            ensure_loopback_url(&ollama_url)
                .map_err(anyhow::Error::msg)
                .context("OLLAMA_API_BASE_URL must point at this machine")?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            let config = gateway_config(
                ollama_url,
                &allowed_origins,
                tavily_api_key,
                reader_url,
                search_url,
                research_url,
            );
            let llama = llama.into_config();
            log_startup(&addr, &config, &llama);

            let state = AppState::new(config, llama);
            if let Err(err) = serve(addr, state).await {
                emit_event(
                    tracing::Level::ERROR,
                    ProcessKind::Gateway,
                    ObservabilityEvent {
                        status: Some("failed"),
                        error_code: Some("GATEWAY_SERVE_FAILED"),
                        detail: Some(&err.to_string()),
                        ..ObservabilityEvent::new("gateway.serve.failed", "gateway.main")
                    },
                );
                return Err(err);
            }
        }
        Command::Models { model_dirs } => {
            let manager = BackendProcessManager::new(LlamaServerConfig {
                model_dirs: model_dirs
                    .as_deref()
                    .map(parse_model_dirs)
                    .unwrap_or_default(),
                ..LlamaServerConfig::default()
            });
            let models = manager.list_models().await;
            println!("{}", serde_json::to_string_pretty(&models)?);
        }
    }

    Ok(())
}

fn gateway_config(
    ollama_url: String,
    allowed_origins: &[String],
    tavily_api_key: Option<String>,
    reader_url: String,
    search_url: String,
    research_url: String,
) -> GatewayConfig {
    let allowed_origins = if allowed_origins.iter().all(|o| o.trim().is_empty()) {
        AllowedOrigins::default()
    } else {
        AllowedOrigins::parse(allowed_origins)
    };
    GatewayConfig {
        ollama_url,
        allowed_origins,
        tavily_api_key: tavily_api_key.filter(|key| !is_placeholder_api_key(key)),
        reader_url,
        search_url,
        research_url,
        ..GatewayConfig::default()
    }
}

fn log_startup(addr: &SocketAddr, config: &GatewayConfig, llama: &LlamaServerConfig) {
    let origins = match &config.allowed_origins {
        AllowedOrigins::Any => "*".to_string(),
        AllowedOrigins::List(list) => list.join(","),
    };
    info!(
        addr = %addr,
        ollama_url = %config.ollama_url,
        allowed_origins = %origins,
        tavily_api_key = %config.tavily_api_key.as_deref().map(redact_text).unwrap_or_default(),
        llama_server = %llama.executable,
        model_dirs = llama.model_dirs.len(),
        llama_port = llama.port,
        "starting OllamaBro gateway"
    );
}
