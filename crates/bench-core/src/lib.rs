use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const DABSTEP_REPO_ID: &str = "adyen/DABstep";
pub const DABSTEP_TASKS_CONFIG: &str = "tasks";
pub const DABSTEP_DEFAULT_SPLIT: &str = "default";
pub const DABSTEP_DEFAULT_SPLIT_TASK_COUNT: usize = 450;
pub const DEFAULT_CONTEXT_DIR: &str = "/tmp/DABstep-data";
pub const DEFAULT_RUNS_DIR: &str = ".bench/runs";

pub const DEFAULT_CONTEXT_FILENAMES: &[&str] = &[
    "data/context/acquirer_countries.csv",
    "data/context/payments-readme.md",
    "data/context/payments.csv",
    "data/context/merchant_category_codes.csv",
    "data/context/fees.json",
    "data/context/merchant_data.json",
    "data/context/manual.md",
];

pub const BENCH_ENV_AGENT_INPUT: &str = "BENCH_AGENT_INPUT";
pub const BENCH_ENV_AGENT_OUTPUT: &str = "BENCH_AGENT_OUTPUT";
pub const BENCH_ENV_RUN_ID: &str = "BENCH_RUN_ID";
pub const BENCH_ENV_SESSION_ID: &str = "BENCH_SESSION_ID";

pub const RUN_MANIFEST_FILE: &str = "run_manifest.json";
pub const ANSWERS_FILE: &str = "answers.jsonl";
pub const TRACES_DIR: &str = "traces";
pub const AGENT_IO_DIR: &str = "agent_io";

pub fn default_context_filenames() -> Vec<String> {
    DEFAULT_CONTEXT_FILENAMES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "deserialize_task_id")]
    pub task_id: String,
    pub question: String,
    #[serde(default)]
    pub guidelines: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_ground_truth",
        skip_serializing_if = "Option::is_none"
    )]
    pub answer: Option<String>,
}

fn deserialize_task_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "task_id must be a string or integer, got {}",
            other
        ))),
    }
}

// The hidden split publishes empty answers; treat those as missing ground truth.
fn deserialize_ground_truth<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFile {
    pub filename: String,
    pub local_path: PathBuf,
}

pub fn context_local_paths(files: &[ContextFile]) -> Vec<PathBuf> {
    files.iter().map(|f| f.local_path.clone()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub task_id: String,
    pub agent_answer: String,
    pub reasoning_trace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub task_id: String,
    pub agent_answer: String,
    pub score: f64,
    pub correct_answer: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub manifest: PathBuf,
    pub answers: PathBuf,
    pub traces_dir: PathBuf,
    pub agent_io_dir: PathBuf,
}

pub fn run_paths(run_dir: &Path) -> RunPaths {
    RunPaths {
        run_dir: run_dir.to_path_buf(),
        manifest: run_dir.join(RUN_MANIFEST_FILE),
        answers: run_dir.join(ANSWERS_FILE),
        traces_dir: run_dir.join(TRACES_DIR),
        agent_io_dir: run_dir.join(AGENT_IO_DIR),
    }
}

pub fn new_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

pub fn file_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a sibling temp file and renames it into place, so readers
/// never observe a partially written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?
        .to_string_lossy();
    let tmp = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    atomic_write_bytes(path, &serde_json::to_vec_pretty(value)?)
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn put_bytes(&self, bytes: &[u8]) -> Result<String> {
        let digest = sha256_bytes(bytes);
        let hex = digest.strip_prefix("sha256:").unwrap_or("unknown");
        let dir = self.root.join("sha256").join(hex);
        ensure_dir(&dir)?;
        let path = dir.join("blob");
        if !path.exists() {
            fs::write(&path, bytes)?;
        }
        Ok(format!("artifact://sha256/{}", hex))
    }

    pub fn read_ref(&self, artifact_ref: &str) -> Result<Vec<u8>> {
        let hex = artifact_ref
            .strip_prefix("artifact://sha256/")
            .ok_or_else(|| anyhow!("invalid artifact ref"))?;
        let path = self.root.join("sha256").join(hex).join("blob");
        Ok(fs::read(path)?)
    }
}

pub fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

pub fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
