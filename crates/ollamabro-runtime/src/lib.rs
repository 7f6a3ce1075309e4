pub mod config;
mod error;
pub mod llmfit;
pub mod models;
mod output;
mod process;

pub use config::{
    parse_model_dirs, LlamaServerConfig, LlamaServerConfigPatch, ModelDirs, DEFAULT_CTX_SIZE,
    DEFAULT_GPU_LAYERS, DEFAULT_LLAMA_PORT, DEFAULT_LLAMA_SERVER, READY_POLL_INTERVAL,
    READY_TIMEOUT, TEARDOWN_GRACE,
};
pub use error::{BackendProcessError, Result};
pub use output::{OutputLine, OutputStream, OutputTail};
pub use models::ModelFile;
pub use process::{
    BackendProcessManager, BackendSnapshot, BackendStatus, LoadedModel, ReadyBackend,
};
