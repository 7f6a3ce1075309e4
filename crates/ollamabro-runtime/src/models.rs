use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{BackendProcessError, Result};

pub const MODEL_EXTENSION: &str = "gguf";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelFile {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub directory: String,
}

pub fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(MODEL_EXTENSION))
}

/// Lists model files directly inside each directory. Missing directories and
/// unreadable entries are skipped.
pub fn scan_model_dirs(dirs: &[PathBuf]) -> Vec<ModelFile> {
    let mut out = Vec::new();
    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(dir = %dir.display(), error = %err, "skipping model directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_model_file(&path) {
                continue;
            }
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            out.push(ModelFile {
                name: name.to_string(),
                path: path.display().to_string(),
                size: meta.len(),
                directory: dir.display().to_string(),
            });
        }
    }
    out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    out
}

/// Resolves `candidate` to a canonical path that lives inside one of
/// `dirs`. Symlinks and `..` segments are resolved before the check.
pub fn resolve_within(candidate: &Path, dirs: &[PathBuf]) -> Result<PathBuf> {
    let resolved = candidate
        .canonicalize()
        .map_err(|_| BackendProcessError::ModelNotFound(candidate.to_path_buf()))?;
    let inside = dirs
        .iter()
        .filter_map(|dir| dir.canonicalize().ok())
        .any(|root| resolved.starts_with(&root) && resolved != root);
    if inside {
        Ok(resolved)
    } else {
        Err(BackendProcessError::OutsideModelDirs(candidate.to_path_buf()))
    }
}

pub fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
