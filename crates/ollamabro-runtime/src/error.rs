use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendProcessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("path is outside the configured model directories: {}", .0.display())]
    OutsideModelDirs(PathBuf),

    #[error("model is currently loaded, stop it first: {}", .0.display())]
    ModelInUse(PathBuf),

    #[error("not a .gguf model file: {}", .0.display())]
    NotAModelFile(PathBuf),

    #[error("model load was cancelled by a stop request")]
    LoadCancelled,

    #[error("failed to spawn llama-server: {0}")]
    Spawn(String),

    #[error("llama-server exited before becoming ready ({status}){}", format_tail(.logs))]
    ExitedEarly { status: String, logs: String },

    #[error("llama-server was not ready after {}s", .0.as_secs())]
    ReadyTimeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("llmfit not found or failed to start: {0}")]
    LlmfitUnavailable(String),

    #[error("llmfit timed out after {}s", .0.as_secs())]
    LlmfitTimeout(Duration),

    #[error("{0}")]
    LlmfitFailed(String),
}

fn format_tail(logs: &str) -> String {
    if logs.trim().is_empty() {
        String::new()
    } else {
        format!("\nrecent logs:\n{logs}")
    }
}

impl BackendProcessError {
    pub fn code(&self) -> &'static str {
        match self {
            BackendProcessError::Io(_) => "IO_ERROR",
            BackendProcessError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            BackendProcessError::OutsideModelDirs(_) => "PATH_OUTSIDE_MODEL_DIRS",
            BackendProcessError::ModelInUse(_) => "MODEL_IN_USE",
            BackendProcessError::NotAModelFile(_) => "NOT_A_MODEL_FILE",
            BackendProcessError::LoadCancelled => "LOAD_CANCELLED",
            BackendProcessError::Spawn(_) | BackendProcessError::LlmfitUnavailable(_) => {
                "SPAWN_FAILED"
            }
            BackendProcessError::ExitedEarly { .. } => "PROCESS_EXITED",
            BackendProcessError::ReadyTimeout(_) | BackendProcessError::LlmfitTimeout(_) => {
                "GATEWAY_TIMEOUT"
            }
            BackendProcessError::InvalidConfig(_) => "INVALID_CONFIG",
            BackendProcessError::LlmfitFailed(_) => "LLMFIT_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendProcessError>;
