use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackendProcessError, Result};

pub const DEFAULT_LLAMA_SERVER: &str = "llama-server";
pub const DEFAULT_LLAMA_PORT: u16 = 8080;
pub const DEFAULT_GPU_LAYERS: u32 = 99;
pub const DEFAULT_CTX_SIZE: u32 = 4096;
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const TEARDOWN_GRACE: Duration = Duration::from_millis(800);

/// Settings for the spawned llama-server. Held in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlamaServerConfig {
    pub executable: String,
    pub model_dirs: Vec<PathBuf>,
    pub gpu_layers: u32,
    pub port: u16,
    pub ctx_size: u32,
    #[serde(skip)]
    pub ready_timeout: Duration,
    #[serde(skip)]
    pub poll_interval: Duration,
    #[serde(skip)]
    pub teardown_grace: Duration,
}

impl Default for LlamaServerConfig {
    fn default() -> Self {
        Self {
            executable: DEFAULT_LLAMA_SERVER.to_string(),
            model_dirs: Vec::new(),
            gpu_layers: DEFAULT_GPU_LAYERS,
            port: DEFAULT_LLAMA_PORT,
            ctx_size: DEFAULT_CTX_SIZE,
            ready_timeout: READY_TIMEOUT,
            poll_interval: READY_POLL_INTERVAL,
            teardown_grace: TEARDOWN_GRACE,
        }
    }
}

/// Partial update from the config endpoint. `modelDirs` accepts either a
/// list or a comma-separated string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlamaServerConfigPatch {
    #[serde(default, alias = "serverPath")]
    pub executable: Option<String>,
    #[serde(default)]
    pub model_dirs: Option<ModelDirs>,
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ctx_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModelDirs {
    List(Vec<String>),
    Joined(String),
}

impl ModelDirs {
    pub fn into_paths(self) -> Vec<PathBuf> {
        match self {
            ModelDirs::List(items) => items
                .iter()
                .flat_map(|item| parse_model_dirs(item))
                .collect(),
            ModelDirs::Joined(joined) => parse_model_dirs(&joined),
        }
    }
}

pub fn parse_model_dirs(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

impl LlamaServerConfig {
    /// Applies `patch` on a copy and returns it when the result is usable.
    pub fn patched(&self, patch: LlamaServerConfigPatch) -> Result<Self> {
        let mut next = self.clone();
        if let Some(executable) = patch.executable {
            let executable = executable.trim().to_string();
            if executable.is_empty() {
                return Err(BackendProcessError::InvalidConfig(
                    "executable path must not be empty".to_string(),
                ));
            }
            next.executable = executable;
        }
        if let Some(dirs) = patch.model_dirs {
            next.model_dirs = dirs.into_paths();
        }
        if let Some(gpu_layers) = patch.gpu_layers {
            next.gpu_layers = gpu_layers;
        }
        if let Some(port) = patch.port {
            if port == 0 {
                return Err(BackendProcessError::InvalidConfig(
                    "port must be between 1 and 65535".to_string(),
                ));
            }
            next.port = port;
        }
        if let Some(ctx_size) = patch.ctx_size {
            if ctx_size == 0 {
                return Err(BackendProcessError::InvalidConfig(
                    "ctxSize must be positive".to_string(),
                ));
            }
            next.ctx_size = ctx_size;
        }
        Ok(next)
    }
}
