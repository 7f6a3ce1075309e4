use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;

use crate::error::{BackendProcessError, Result};

pub const DEFAULT_LLMFIT: &str = "llmfit";
pub const LLMFIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `llmfit --json fit` and returns its JSON report of models that fit
/// this machine.
pub async fn recommend(executable: &str, timeout: Duration) -> Result<Value> {
    let child = Command::new(executable)
        .args(["--json", "fit"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackendProcessError::LlmfitUnavailable(e.to_string()))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => return Err(BackendProcessError::LlmfitTimeout(timeout)),
        Ok(result) => result?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("llmfit exited with {}", output.status)
        } else {
            stderr
        };
        return Err(BackendProcessError::LlmfitFailed(detail));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|_| BackendProcessError::LlmfitFailed("Failed to parse llmfit output".to_string()))
}
