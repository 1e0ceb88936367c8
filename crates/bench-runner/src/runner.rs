use crate::agent::{sanitize_steps, serialize_trace, Agent};
use crate::config::{BenchConfig, FailurePolicy};
use crate::instrument::{record_step_spans, truncate};
use crate::prompt::build_prompt;
use crate::sink::{
    AnswerSink, JsonlAnswerSink, ManifestContextFile, RunManifestRecord,
    RUN_MANIFEST_SCHEMA_VERSION,
};
use anyhow::{Context, Result};
use bench_core::{context_local_paths, new_run_id, sha256_file, AnswerRecord, ContextFile, Task};
use bench_otel::Tracer;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const TASK_SPAN_NAME: &str = "benchmark.task";
const EMPTY_TRACE: &str = "[]";

pub struct RunOptions<'a> {
    pub tracer: Option<&'a Tracer>,
    pub failure_policy: FailurePolicy,
    /// Constant for every task of a run so the collector groups them.
    pub session_id: String,
}

impl RunOptions<'_> {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            tracer: None,
            failure_policy: FailurePolicy::default(),
            session_id: session_id.into(),
        }
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Runs every task through `agent` in input order, producing one answer
/// record per task. Records are streamed to `sink` as they are produced.
pub fn run_benchmark(
    tasks: &[Task],
    agent: &mut dyn Agent,
    context_files: &[PathBuf],
    options: &RunOptions<'_>,
    mut sink: Option<&mut dyn AnswerSink>,
) -> Result<Vec<AnswerRecord>> {
    let total = tasks.len();
    let mut answers = Vec::with_capacity(total);

    for (idx, task) in tasks.iter().enumerate() {
        info!(task_id = %task.task_id, progress = %format!("{}/{}", idx + 1, total), "running task");
        let prompt = build_prompt(context_files, &task.question, &task.guidelines);

        let mut span = options.tracer.map(|t| t.start_span(TASK_SPAN_NAME));
        if let Some(span) = span.as_mut() {
            span.set_attribute("session.id", &options.session_id);
            span.set_attribute("langfuse.session.id", &options.session_id);
            span.set_attribute("task.id", &task.task_id);
            if let Some(level) = &task.level {
                span.set_attribute("task.level", level);
            }
            span.set_attribute("input.value", truncate(&task.question));
        }
        let trace_id = span.as_ref().map(|s| s.trace_id().to_string());

        let record = match agent.run(&prompt) {
            Ok(run) => {
                if let Some(span) = span.as_mut() {
                    record_step_spans(span, &run.steps);
                    span.set_attribute("output.value", truncate(&run.answer));
                    span.set_attribute("agent.steps", run.steps.len());
                    span.set_ok();
                }
                let steps = sanitize_steps(run.steps);
                AnswerRecord {
                    task_id: task.task_id.clone(),
                    agent_answer: run.answer,
                    reasoning_trace: serialize_trace(&steps)?,
                    trace_id,
                    error: None,
                }
            }
            Err(err) => {
                let message = format!("{:#}", err);
                if let Some(span) = span.as_mut() {
                    span.set_error(message.clone());
                }
                if options.failure_policy == FailurePolicy::Abort {
                    return Err(err.context(format!("agent failed on task {}", task.task_id)));
                }
                warn!(task_id = %task.task_id, error = %message, "agent failed; recording empty answer");
                AnswerRecord {
                    task_id: task.task_id.clone(),
                    agent_answer: String::new(),
                    reasoning_trace: EMPTY_TRACE.to_string(),
                    trace_id,
                    error: Some(message),
                }
            }
        };
        if let Some(span) = span {
            span.end();
        }

        if let Some(sink) = sink.as_mut() {
            sink.append_answer(&record)?;
        }
        answers.push(record);
    }

    if let Some(sink) = sink.as_mut() {
        sink.flush()?;
    }
    let failed = answers.iter().filter(|a| a.error.is_some()).count();
    info!(tasks = total, failed, "benchmark finished");
    Ok(answers)
}

#[derive(Debug, Clone)]
pub struct RunSetup {
    pub run_id: String,
    pub session_id: String,
    pub run_dir: PathBuf,
}

impl RunSetup {
    /// Picks a fresh run directory under `out_dir`; a second run within the
    /// same second gets a numeric suffix.
    pub fn new(out_dir: &Path) -> Self {
        let base = new_run_id();
        let mut run_id = base.clone();
        let mut n = 1;
        while out_dir.join(&run_id).exists() {
            n += 1;
            run_id = format!("{}_{}", base, n);
        }
        Self {
            run_dir: out_dir.join(&run_id),
            run_id,
            session_id: new_session_id(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub session_id: String,
    pub answers: Vec<AnswerRecord>,
}

/// Runs the benchmark into `setup.run_dir`: writes the run manifest, then
/// streams answers to `answers.jsonl`.
pub fn execute_run(
    setup: &RunSetup,
    config: &BenchConfig,
    tasks: &[Task],
    context_files: &[ContextFile],
    agent: &mut dyn Agent,
    tracer: Option<&Tracer>,
) -> Result<RunResult> {
    let mut sink = JsonlAnswerSink::new(&setup.run_dir)?;

    let mut manifest_files = Vec::with_capacity(context_files.len());
    for file in context_files {
        manifest_files.push(ManifestContextFile {
            filename: file.filename.clone(),
            sha256: sha256_file(&file.local_path).with_context(|| {
                format!("failed to hash context file {}", file.local_path.display())
            })?,
        });
    }
    sink.write_run_manifest(&RunManifestRecord {
        schema_version: RUN_MANIFEST_SCHEMA_VERSION.to_string(),
        run_id: setup.run_id.clone(),
        session_id: setup.session_id.clone(),
        created_at: Utc::now().to_rfc3339(),
        dataset: serde_json::to_value(&config.dataset)?,
        model: serde_json::to_value(&config.agent.model)?,
        task_count: tasks.len(),
        context_files: manifest_files,
    })?;
    info!(
        run_id = %setup.run_id,
        session_id = %setup.session_id,
        run_dir = %setup.run_dir.display(),
        tasks = tasks.len(),
        "run started"
    );

    let options = RunOptions {
        tracer,
        failure_policy: config.failure_policy,
        session_id: setup.session_id.clone(),
    };
    let answers = run_benchmark(
        tasks,
        agent,
        &context_local_paths(context_files),
        &options,
        Some(&mut sink),
    )?;

    Ok(RunResult {
        run_id: setup.run_id.clone(),
        run_dir: setup.run_dir.clone(),
        session_id: setup.session_id.clone(),
        answers,
    })
}
