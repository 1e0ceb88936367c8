use anyhow::{anyhow, Context, Result};
use bench_core::{
    default_context_filenames, DABSTEP_DEFAULT_SPLIT, DABSTEP_DEFAULT_SPLIT_TASK_COUNT,
    DABSTEP_REPO_ID, DABSTEP_TASKS_CONFIG, DEFAULT_CONTEXT_DIR, DEFAULT_RUNS_DIR,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_MODEL_ID: &str = "openai/gpt-4o";
const DEFAULT_MAX_STEPS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure on the task's answer and keep going.
    #[default]
    Record,
    /// Stop the run on the first agent failure.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub dataset: DatasetConfig,
    pub context: ContextConfig,
    pub agent: AgentConfig,
    pub output: OutputConfig,
    pub tracing: TracingConfig,
    pub failure_policy: FailurePolicy,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            context: ContextConfig::default(),
            agent: AgentConfig::default(),
            output: OutputConfig::default(),
            tracing: TracingConfig::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    pub repo_id: String,
    pub config: String,
    pub split: String,
    pub tasks_file: Option<PathBuf>,
    pub expected_count: Option<usize>,
    pub limit: Option<usize>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            repo_id: DABSTEP_REPO_ID.to_string(),
            config: DABSTEP_TASKS_CONFIG.to_string(),
            split: DABSTEP_DEFAULT_SPLIT.to_string(),
            tasks_file: None,
            expected_count: None,
            limit: None,
        }
    }
}

impl DatasetConfig {
    /// The hub's full default split is known to hold a fixed number of
    /// tasks; other sources are only checked when a count is configured.
    pub fn effective_expected_count(&self) -> Option<usize> {
        if self.expected_count.is_some() {
            return self.expected_count;
        }
        if self.tasks_file.is_none()
            && self.repo_id == DABSTEP_REPO_ID
            && self.split == DABSTEP_DEFAULT_SPLIT
        {
            return Some(DABSTEP_DEFAULT_SPLIT_TASK_COUNT);
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    pub dest_dir: PathBuf,
    pub filenames: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            dest_dir: PathBuf::from(DEFAULT_CONTEXT_DIR),
            filenames: default_context_filenames(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSettings {
    pub model_id: String,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            temperature: None,
            seed: None,
            max_tokens: None,
            reasoning_effort: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub command: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
    pub max_steps: u32,
    pub model: ModelSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            workdir: None,
            env: BTreeMap::new(),
            timeout_secs: None,
            max_steps: DEFAULT_MAX_STEPS,
            model: ModelSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub persist_scores: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_RUNS_DIR),
            persist_scores: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracingConfig {
    pub enabled: bool,
    pub service_name: String,
    pub local_collector: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: bench_otel::DEFAULT_SERVICE_NAME.to_string(),
            local_collector: false,
        }
    }
}

pub fn load_config(path: &Path) -> Result<BenchConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: BenchConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("invalid config {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &BenchConfig) -> Result<()> {
    if config.agent.max_steps == 0 {
        return Err(anyhow!("agent.max_steps must be > 0"));
    }
    if config.agent.model.model_id.trim().is_empty() {
        return Err(anyhow!("agent.model.model_id must not be empty"));
    }
    if config.context.filenames.is_empty() {
        return Err(anyhow!("context.filenames must list at least one file"));
    }
    if config.agent.timeout_secs == Some(0) {
        return Err(anyhow!("agent.timeout_secs must be > 0 when set"));
    }
    if config.dataset.limit == Some(0) {
        return Err(anyhow!("dataset.limit must be > 0 when set"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_dabstep_constants() {
        let config = BenchConfig::default();
        assert_eq!(config.dataset.repo_id, "adyen/DABstep");
        assert_eq!(config.dataset.config, "tasks");
        assert_eq!(config.dataset.split, "default");
        assert_eq!(config.context.dest_dir, PathBuf::from("/tmp/DABstep-data"));
        assert_eq!(config.context.filenames.len(), 7);
        assert_eq!(config.failure_policy, FailurePolicy::Record);
        assert_eq!(config.dataset.effective_expected_count(), Some(450));
        validate_config(&config).expect("defaults are valid");
    }

    #[test]
    fn yaml_overrides_only_the_given_fields() {
        let config: BenchConfig = serde_yaml::from_str(
            r#"
dataset:
  split: dev
agent:
  command: ["python", "agent.py"]
  max_steps: 6
  model:
    model_id: openai/o3-mini
    reasoning_effort: high
    seed: 42
failure_policy: abort
"#,
        )
        .expect("yaml should parse");
        assert_eq!(config.dataset.split, "dev");
        assert_eq!(config.dataset.repo_id, "adyen/DABstep");
        assert_eq!(config.dataset.effective_expected_count(), None);
        assert_eq!(config.agent.command, vec!["python", "agent.py"]);
        assert_eq!(config.agent.max_steps, 6);
        assert_eq!(config.agent.model.reasoning_effort.as_deref(), Some("high"));
        assert_eq!(config.agent.model.seed, Some(42));
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert!(config.output.persist_scores);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<BenchConfig>("agent:\n  max_step: 3\n")
            .expect_err("typo should fail");
        assert!(err.to_string().contains("max_step"));
    }

    #[test]
    fn zero_max_steps_is_invalid() {
        let mut config = BenchConfig::default();
        config.agent.max_steps = 0;
        assert!(validate_config(&config).is_err());
    }
}
