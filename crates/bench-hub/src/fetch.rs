use anyhow::{Context, Result};
use bench_core::{default_context_filenames, ensure_dir, ContextFile, DABSTEP_REPO_ID};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Anything that can materialize a named repository file inside `local_dir`,
/// preserving the file's repo-relative path.
pub trait ContentSource {
    fn download(&self, repo_id: &str, filename: &str, local_dir: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{path} does not exist.")]
    MissingContextFile { path: PathBuf },
    #[error("context filename must be a relative path without '..': {filename}")]
    UnsafeFilename { filename: String },
}

#[derive(Debug, Clone)]
pub struct ContextFetchConfig {
    pub repo_id: String,
    pub filenames: Vec<String>,
    pub dest_dir: PathBuf,
}

impl ContextFetchConfig {
    pub fn dabstep(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_id: DABSTEP_REPO_ID.to_string(),
            filenames: default_context_filenames(),
            dest_dir: dest_dir.into(),
        }
    }
}

fn validate_filename(filename: &str) -> Result<(), FetchError> {
    let path = Path::new(filename);
    let safe = !filename.trim().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if safe {
        Ok(())
    } else {
        Err(FetchError::UnsafeFilename {
            filename: filename.to_string(),
        })
    }
}

/// Wipes `dest_dir`, downloads every configured file fresh, and returns the
/// local references in configuration order. Any file that did not
/// materialize is a hard failure.
pub fn fetch_context_files(
    source: &dyn ContentSource,
    config: &ContextFetchConfig,
) -> Result<Vec<ContextFile>> {
    for filename in &config.filenames {
        validate_filename(filename)?;
    }

    if config.dest_dir.exists() {
        fs::remove_dir_all(&config.dest_dir).with_context(|| {
            format!(
                "failed to clear context dir {}",
                config.dest_dir.display()
            )
        })?;
    }
    ensure_dir(&config.dest_dir)?;

    for filename in &config.filenames {
        source
            .download(&config.repo_id, filename, &config.dest_dir)
            .with_context(|| format!("failed to download {} from {}", filename, config.repo_id))?;
    }

    let files = verify_context_files(&config.dest_dir, &config.filenames)?;
    info!(
        repo_id = %config.repo_id,
        dest_dir = %config.dest_dir.display(),
        count = files.len(),
        "context files ready"
    );
    Ok(files)
}

/// Resolves each filename under `dest_dir` and fails on the first one that
/// does not exist as a regular file.
pub fn verify_context_files(dest_dir: &Path, filenames: &[String]) -> Result<Vec<ContextFile>> {
    let mut files = Vec::with_capacity(filenames.len());
    for filename in filenames {
        let local_path = dest_dir.join(filename);
        if !local_path.is_file() {
            return Err(FetchError::MissingContextFile { path: local_path }.into());
        }
        files.push(ContextFile {
            filename: filename.clone(),
            local_path,
        });
    }

    let unexpected = unexpected_files(dest_dir, filenames);
    if !unexpected.is_empty() {
        warn!(?unexpected, "context dir contains files outside the configured list");
    }
    Ok(files)
}

/// Lists every regular file under `dir` as a `/`-separated relative path.
pub fn list_context_dir(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(dir) {
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            out.push(parts.join("/"));
        }
    }
    out.sort();
    out
}

fn unexpected_files(dir: &Path, expected: &[String]) -> Vec<String> {
    let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    list_context_dir(dir)
        .into_iter()
        .filter(|f| !expected.contains(f.as_str()))
        .collect()
}
