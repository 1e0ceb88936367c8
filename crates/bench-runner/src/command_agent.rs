use crate::agent::{Agent, AgentRun, AgentStep};
use crate::config::{AgentConfig, ModelSettings};
use anyhow::{Context, Result};
use bench_core::{
    atomic_write_json_pretty, ensure_dir, BENCH_ENV_AGENT_INPUT, BENCH_ENV_AGENT_OUTPUT,
    BENCH_ENV_RUN_ID, BENCH_ENV_SESSION_ID,
};
use bench_schemas::{validate_value, AGENT_INPUT_SCHEMA, AGENT_RUN_SCHEMA};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent command is empty")]
    EmptyCommand,
    #[error("failed to spawn agent process `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent process timed out after {secs}s and was killed")]
    Timeout { secs: u64 },
    #[error("agent process exited with status {status} (stderr: {stderr_log})")]
    NonZeroExit { status: String, stderr_log: PathBuf },
    #[error("agent process wrote no output to {path}")]
    MissingOutput { path: PathBuf },
    #[error("agent output {path} is invalid: {reason}")]
    InvalidOutput { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub schema_version: String,
    pub run_id: String,
    pub prompt: String,
    pub model: ModelSettings,
    pub max_steps: u32,
}

#[derive(Debug, Deserialize)]
struct AgentOutput {
    answer: Value,
    #[serde(default)]
    steps: Vec<AgentStep>,
}

struct InvocationPaths {
    input: PathBuf,
    output: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
}

/// Runs an external agent program once per prompt. The program reads the
/// `agent_input_v1` document named by `BENCH_AGENT_INPUT` and writes an
/// `agent_run_v1` document to `BENCH_AGENT_OUTPUT`.
pub struct CommandAgent {
    command: Vec<String>,
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    model: ModelSettings,
    max_steps: u32,
    io_dir: PathBuf,
    run_id: String,
    session_id: String,
    invocations: usize,
}

impl CommandAgent {
    pub fn new(config: &AgentConfig, io_dir: &Path, run_id: &str, session_id: &str) -> Result<Self> {
        if config.command.is_empty() {
            return Err(AgentError::EmptyCommand.into());
        }
        ensure_dir(io_dir)?;
        Ok(Self {
            command: config.command.clone(),
            workdir: config.workdir.clone(),
            env: config.env.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            model: config.model.clone(),
            max_steps: config.max_steps,
            io_dir: io_dir.to_path_buf(),
            run_id: run_id.to_string(),
            session_id: session_id.to_string(),
            invocations: 0,
        })
    }

    fn next_paths(&mut self) -> InvocationPaths {
        self.invocations += 1;
        let prefix = format!("{:04}", self.invocations);
        InvocationPaths {
            input: self.io_dir.join(format!("{}_input.json", prefix)),
            output: self.io_dir.join(format!("{}_output.json", prefix)),
            stdout: self.io_dir.join(format!("{}_stdout.log", prefix)),
            stderr: self.io_dir.join(format!("{}_stderr.log", prefix)),
        }
    }

    fn write_input(&self, path: &Path, prompt: &str) -> Result<()> {
        let input = AgentInput {
            schema_version: "agent_input_v1".to_string(),
            run_id: self.run_id.clone(),
            prompt: prompt.to_string(),
            model: self.model.clone(),
            max_steps: self.max_steps,
        };
        validate_value(AGENT_INPUT_SCHEMA, &serde_json::to_value(&input)?)?;
        atomic_write_json_pretty(path, &input)
    }

    fn spawn_and_wait(&self, paths: &InvocationPaths) -> Result<ExitStatus> {
        let program = &self.command[0];
        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.env(BENCH_ENV_AGENT_INPUT, &paths.input);
        cmd.env(BENCH_ENV_AGENT_OUTPUT, &paths.output);
        cmd.env(BENCH_ENV_RUN_ID, &self.run_id);
        cmd.env(BENCH_ENV_SESSION_ID, &self.session_id);
        cmd.stdin(Stdio::null());
        cmd.stdout(File::create(&paths.stdout)?);
        cmd.stderr(File::create(&paths.stderr)?);

        let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!(pid = child.id(), program = %program, "agent process started");

        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AgentError::Timeout {
                        secs: limit.as_secs(),
                    }
                    .into());
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Agent for CommandAgent {
    fn run(&mut self, prompt: &str) -> Result<AgentRun> {
        let paths = self.next_paths();
        if paths.output.exists() {
            fs::remove_file(&paths.output)?;
        }
        self.write_input(&paths.input, prompt)?;

        let status = self.spawn_and_wait(&paths)?;
        if !status.success() {
            return Err(AgentError::NonZeroExit {
                status: status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_log: paths.stderr.clone(),
            }
            .into());
        }
        read_agent_output(&paths.output)
    }
}

pub fn read_agent_output(path: &Path) -> Result<AgentRun> {
    if !path.exists() {
        return Err(AgentError::MissingOutput {
            path: path.to_path_buf(),
        }
        .into());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read agent output {}", path.display()))?;
    let invalid = |reason: String| AgentError::InvalidOutput {
        path: path.to_path_buf(),
        reason,
    };
    let value: Value = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
    validate_value(AGENT_RUN_SCHEMA, &value).map_err(|e| invalid(e.to_string()))?;
    let output: AgentOutput = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;

    let answer = match output.answer {
        Value::String(s) => s,
        Value::Null => {
            warn!(path = %path.display(), "agent returned a null answer");
            String::new()
        }
        other => other.to_string(),
    };
    Ok(AgentRun {
        answer,
        steps: output.steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(label: &str) -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time should be monotonic")
                .as_nanos();
            let path = std::env::temp_dir().join(format!("bench_command_agent_{}_{}", label, nanos));
            fs::create_dir_all(&path).expect("create temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn shell_agent(script: &str, timeout_secs: Option<u64>) -> AgentConfig {
        AgentConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn output_with_non_string_answer_is_stringified() {
        let dir = TempDirGuard::new("stringify");
        let path = dir.path.join("out.json");
        fs::write(
            &path,
            r#"{"answer": 0.51, "steps": [{"type": "action", "step_number": 1, "agent_memory": []}]}"#,
        )
        .expect("write output");
        let run = read_agent_output(&path).expect("output should parse");
        assert_eq!(run.answer, "0.51");
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].kind(), "action");
    }

    #[test]
    fn structured_step_errors_and_null_plans_keep_the_answer() {
        let dir = TempDirGuard::new("loose_steps");
        let path = dir.path.join("out.json");
        fs::write(
            &path,
            r#"{"answer": "NL", "steps": [
                {"type": "planning", "plan": null},
                {"type": "action", "step_number": 1,
                 "error": {"type": "AgentExecutionError", "message": "boom"}}
            ]}"#,
        )
        .expect("write output");
        let run = read_agent_output(&path).expect("output should parse");
        assert_eq!(run.answer, "NL");
        assert_eq!(run.steps.len(), 2);
        match &run.steps[1] {
            AgentStep::Action(action) => {
                assert_eq!(action.error.as_ref().and_then(|e| e["message"].as_str()), Some("boom"));
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn output_with_unknown_step_type_is_rejected() {
        let dir = TempDirGuard::new("bad_step");
        let path = dir.path.join("out.json");
        fs::write(&path, r#"{"answer": "x", "steps": [{"type": "thinking"}]}"#)
            .expect("write output");
        let err = read_agent_output(&path).expect_err("unknown step type");
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn missing_output_is_typed() {
        let dir = TempDirGuard::new("missing");
        let err = read_agent_output(&dir.path.join("none.json")).expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::MissingOutput { .. })
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = TempDirGuard::new("empty");
        let err = match CommandAgent::new(&AgentConfig::default(), &dir.path, "run_1", "s") {
            Ok(_) => panic!("empty command should fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::EmptyCommand)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn shell_agent_reads_input_and_writes_output() {
        let dir = TempDirGuard::new("shell");
        let script = r#"grep -q '"prompt": "What is 6 x 7?"' "$BENCH_AGENT_INPUT" || exit 9
echo "run=$BENCH_RUN_ID session=$BENCH_SESSION_ID"
printf '{"answer": 42, "steps": [{"type": "task", "task": "q"}, {"type": "action", "step_number": 1}]}' > "$BENCH_AGENT_OUTPUT""#;
        let mut agent = CommandAgent::new(&shell_agent(script, Some(30)), &dir.path, "run_1", "sess-1")
            .expect("agent should build");
        let run = agent.run("What is 6 x 7?").expect("agent should succeed");
        assert_eq!(run.answer, "42");
        assert_eq!(run.steps.len(), 2);

        let stdout = fs::read_to_string(dir.path.join("0001_stdout.log")).expect("stdout log");
        assert_eq!(stdout.trim(), "run=run_1 session=sess-1");
        let input: Value = serde_json::from_str(
            &fs::read_to_string(dir.path.join("0001_input.json")).expect("input file"),
        )
        .expect("input json");
        assert_eq!(input["schema_version"], "agent_input_v1");
        assert_eq!(input["max_steps"], 10);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_an_error() {
        let dir = TempDirGuard::new("exit");
        let mut agent = CommandAgent::new(&shell_agent("echo boom >&2; exit 3", None), &dir.path, "r", "s")
            .expect("agent should build");
        let err = agent.run("p").expect_err("exit 3 should fail");
        match err.downcast_ref::<AgentError>() {
            Some(AgentError::NonZeroExit { status, .. }) => assert_eq!(status, "3"),
            other => panic!("unexpected error: {:?}", other),
        }
        let stderr = fs::read_to_string(dir.path.join("0001_stderr.log")).expect("stderr log");
        assert_eq!(stderr.trim(), "boom");
    }

    #[cfg(unix)]
    #[test]
    fn slow_agent_is_killed_on_timeout() {
        let dir = TempDirGuard::new("timeout");
        let mut agent = CommandAgent::new(&shell_agent("sleep 10", Some(1)), &dir.path, "r", "s")
            .expect("agent should build");
        let started = Instant::now();
        let err = agent.run("p").expect_err("should time out");
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::Timeout { secs: 1 })
        ));
        assert!(started.elapsed() < Duration::from_secs(8));
    }
}
