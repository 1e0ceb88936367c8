use anyhow::{anyhow, Result};
use bench_analysis::{
    evaluate, render_score_table, write_score_table, Evaluation, ExactMatchScorer, FactoidScorer,
    Scorer,
};
use bench_core::{run_paths, ArtifactStore, ContextFile, Task};
use bench_hub::{
    check_task_count, fetch_context_files, load_tasks_file, verify_context_files,
    ContextFetchConfig, HubClient,
};
use bench_otel::{setup_langfuse, setup_otlp, LangfuseConfig, LocalCollector, TracerProvider};
use bench_runner::{
    execute_run, load_config, read_answers, validate_config, BenchConfig, CommandAgent,
    DatasetConfig, FailurePolicy, RunSetup,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TRACER_SCOPE: &str = "bench-runner";
const INGEST_RECORDS_FILE: &str = "ingest_records.json";

#[derive(Parser)]
#[command(name = "bench", version = "0.1.0", about = "DABstep benchmark harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScorerArg {
    #[value(name = "factoid")]
    Factoid,
    #[value(name = "exact")]
    Exact,
}

impl ScorerArg {
    fn build(self) -> Box<dyn Scorer> {
        match self {
            Self::Factoid => Box::new(FactoidScorer),
            Self::Exact => Box::new(ExactMatchScorer),
        }
    }
}

#[derive(clap::Args, Clone, Debug, Default)]
struct DatasetArgs {
    #[arg(long)]
    split: Option<String>,
    #[arg(long)]
    tasks_file: Option<PathBuf>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the context files into a fresh scratch directory.
    FetchContext {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Load the task dataset and print a short summary.
    Tasks {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        dataset: DatasetArgs,
        #[arg(long)]
        json: bool,
    },
    /// Run every task through the agent and write answers.jsonl.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        dataset: DatasetArgs,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        context_dir: Option<PathBuf>,
        /// Reuse the context files already in the scratch directory.
        #[arg(long)]
        skip_fetch: bool,
        #[arg(long)]
        fail_fast: bool,
        #[arg(long)]
        local_collector: bool,
        #[arg(long)]
        no_trace: bool,
        /// Scorer for the automatic evaluation when tasks carry ground truth.
        #[arg(long, value_enum, default_value = "factoid")]
        scorer: ScorerArg,
        #[arg(long)]
        json: bool,
        /// Agent command, e.g. `bench run -- python agent.py`.
        #[arg(last = true)]
        agent_cmd: Vec<String>,
    },
    /// Score an answers file against ground truth.
    Evaluate {
        #[arg(long, conflicts_with = "answers")]
        run_dir: Option<PathBuf>,
        #[arg(long)]
        answers: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        dataset: DatasetArgs,
        #[arg(long, value_enum, default_value = "factoid")]
        scorer: ScorerArg,
        #[arg(long)]
        no_persist: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::FetchContext { config, dest, json } => {
            let mut config = resolve_config(config.as_deref())?;
            if let Some(dest) = dest {
                config.context.dest_dir = dest;
            }
            let files = fetch_context(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "fetch-context",
                    "dest_dir": config.context.dest_dir.display().to_string(),
                    "files": context_files_to_json(&files),
                })));
            }
            for file in &files {
                println!("{}", file.local_path.display());
            }
        }
        Commands::Tasks {
            config,
            dataset,
            json,
        } => {
            let mut config = resolve_config(config.as_deref())?;
            apply_dataset_args(&mut config.dataset, &dataset);
            let tasks = load_tasks(&config.dataset)?;
            let by_level = count_by_level(&tasks);
            let with_truth = tasks.iter().filter(|t| t.answer.is_some()).count();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "tasks",
                    "count": tasks.len(),
                    "with_ground_truth": with_truth,
                    "by_level": by_level,
                })));
            }
            println!("tasks: {}", tasks.len());
            println!("with ground truth: {}", with_truth);
            for (level, count) in &by_level {
                println!("  {}: {}", level, count);
            }
        }
        Commands::Run {
            config,
            dataset,
            out_dir,
            context_dir,
            skip_fetch,
            fail_fast,
            local_collector,
            no_trace,
            scorer,
            json,
            agent_cmd,
        } => {
            let mut config = resolve_config(config.as_deref())?;
            apply_dataset_args(&mut config.dataset, &dataset);
            if let Some(dir) = out_dir {
                config.output.dir = dir;
            }
            if let Some(dir) = context_dir {
                config.context.dest_dir = dir;
            }
            if !agent_cmd.is_empty() {
                config.agent.command = agent_cmd;
            }
            if fail_fast {
                config.failure_policy = FailurePolicy::Abort;
            }
            if local_collector {
                config.tracing.local_collector = true;
            }
            if no_trace {
                config.tracing.enabled = false;
            }
            validate_config(&config)?;
            if config.agent.command.is_empty() {
                return Err(anyhow!(
                    "no agent command: set agent.command in the config or pass `-- <cmd>`"
                ));
            }

            let context_files = if skip_fetch {
                verify_context_files(&config.context.dest_dir, &config.context.filenames)?
            } else {
                fetch_context(&config)?
            };
            let tasks = load_tasks(&config.dataset)?;

            let setup = RunSetup::new(&config.output.dir);
            let paths = run_paths(&setup.run_dir);
            let (provider, collector) = setup_tracing(&config, &paths.traces_dir)?;
            let tracer = provider.as_ref().map(|p| p.tracer(TRACER_SCOPE));

            let mut agent = CommandAgent::new(
                &config.agent,
                &paths.agent_io_dir,
                &setup.run_id,
                &setup.session_id,
            )?;
            let result = execute_run(
                &setup,
                &config,
                &tasks,
                &context_files,
                &mut agent,
                tracer.as_ref(),
            );

            let trace_payloads = match collector {
                Some(collector) => {
                    let records = collector.stop();
                    bench_core::atomic_write_json_pretty(
                        &paths.traces_dir.join(INGEST_RECORDS_FILE),
                        &records,
                    )?;
                    Some(records.len())
                }
                None => None,
            };
            let result = result?;

            let evaluation = if !tasks.is_empty() && tasks.iter().all(|t| t.answer.is_some()) {
                let scorer = scorer.build();
                let evaluation = evaluate(&result.answers, &tasks, scorer.as_ref())?;
                if config.output.persist_scores {
                    write_score_table(&result.run_dir, &evaluation)?;
                }
                Some(evaluation)
            } else {
                info!("tasks carry no ground truth; submit answers.jsonl to the leaderboard");
                None
            };

            let failed = result.answers.iter().filter(|a| a.error.is_some()).count();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": {
                        "run_id": result.run_id,
                        "run_dir": result.run_dir.display().to_string(),
                        "session_id": result.session_id,
                        "answers": paths.answers.display().to_string(),
                        "task_count": result.answers.len(),
                        "failed": failed,
                    },
                    "trace_payloads": trace_payloads,
                    "evaluation": evaluation.as_ref().map(evaluation_to_json),
                })));
            }
            println!("run_id: {}", result.run_id);
            println!("run_dir: {}", result.run_dir.display());
            println!("answers: {}", paths.answers.display());
            println!("tasks: {} ({} failed)", result.answers.len(), failed);
            if let Some(evaluation) = &evaluation {
                println!("scorer: {}", evaluation.scorer);
                println!();
                print!("{}", render_score_table(evaluation));
            }
        }
        Commands::Evaluate {
            run_dir,
            answers,
            config,
            dataset,
            scorer,
            no_persist,
            json,
        } => {
            let (answers_path, out_dir) = match (run_dir, answers) {
                (Some(run_dir), None) => (run_paths(&run_dir).answers, run_dir),
                (None, Some(path)) => {
                    let parent = path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from("."));
                    (path, parent)
                }
                _ => return Err(anyhow!("pass exactly one of --run-dir or --answers")),
            };
            let mut config = resolve_config(config.as_deref())?;
            apply_dataset_args(&mut config.dataset, &dataset);
            // Subset runs are scored against the full split.
            config.dataset.limit = None;

            let answers = read_answers(&answers_path)?;
            let tasks = load_tasks(&config.dataset)?;
            let scorer = scorer.build();
            let evaluation = evaluate(&answers, &tasks, scorer.as_ref())?;
            let persisted = if no_persist {
                None
            } else {
                Some(write_score_table(&out_dir, &evaluation)?)
            };

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "evaluate",
                    "answers": answers_path.display().to_string(),
                    "evaluation": evaluation_to_json(&evaluation),
                    "scores_file": persisted.as_ref().map(|p| p.scores.display().to_string()),
                    "summary_file": persisted.as_ref().map(|p| p.summary.display().to_string()),
                })));
            }
            print!("{}", render_score_table(&evaluation));
            if let Some(paths) = persisted {
                println!("scores: {}", paths.scores.display());
                println!("summary: {}", paths.summary.display());
            }
        }
    }
    Ok(None)
}

fn resolve_config(path: Option<&Path>) -> Result<BenchConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(BenchConfig::default()),
    }
}

fn apply_dataset_args(dataset: &mut DatasetConfig, args: &DatasetArgs) {
    if let Some(split) = &args.split {
        dataset.split = split.clone();
    }
    if let Some(path) = &args.tasks_file {
        dataset.tasks_file = Some(path.clone());
    }
    if args.limit.is_some() {
        dataset.limit = args.limit;
    }
}

fn fetch_context(config: &BenchConfig) -> Result<Vec<ContextFile>> {
    let client = HubClient::from_env()?;
    let fetch = ContextFetchConfig {
        repo_id: config.dataset.repo_id.clone(),
        filenames: config.context.filenames.clone(),
        dest_dir: config.context.dest_dir.clone(),
    };
    fetch_context_files(&client, &fetch)
}

/// Loads the configured split, checks its size, then applies the limit.
fn load_tasks(dataset: &DatasetConfig) -> Result<Vec<Task>> {
    let mut tasks = match &dataset.tasks_file {
        Some(path) => load_tasks_file(path)?,
        None => HubClient::from_env()?.fetch_tasks(&dataset.repo_id, &dataset.config, &dataset.split)?,
    };
    check_task_count(&tasks, dataset.effective_expected_count())?;
    if let Some(limit) = dataset.limit {
        tasks.truncate(limit);
    }
    Ok(tasks)
}

fn setup_tracing(
    config: &BenchConfig,
    traces_dir: &Path,
) -> Result<(Option<TracerProvider>, Option<LocalCollector>)> {
    if !config.tracing.enabled {
        return Ok((None, None));
    }
    let service_name = config.tracing.service_name.as_str();
    if config.tracing.local_collector {
        let collector = LocalCollector::start(0, ArtifactStore::new(traces_dir))?;
        info!(endpoint = %collector.endpoint, "local trace collector listening");
        let provider = setup_otlp(&collector.endpoint, Vec::new(), service_name)?;
        return Ok((Some(provider), Some(collector)));
    }
    match LangfuseConfig::from_env() {
        Some(langfuse) => Ok((Some(setup_langfuse(&langfuse, service_name)?), None)),
        None => {
            warn!("no LANGFUSE_* settings found; tracing disabled for this run");
            Ok((None, None))
        }
    }
}

fn count_by_level(tasks: &[Task]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for task in tasks {
        let level = task.level.clone().unwrap_or_else(|| "unknown".to_string());
        *counts.entry(level).or_insert(0) += 1;
    }
    counts
}

fn context_files_to_json(files: &[ContextFile]) -> Value {
    Value::Array(
        files
            .iter()
            .map(|f| {
                json!({
                    "filename": f.filename,
                    "local_path": f.local_path.display().to_string(),
                })
            })
            .collect(),
    )
}

fn evaluation_to_json(evaluation: &Evaluation) -> Value {
    json!({
        "scorer": evaluation.scorer,
        "accuracy": evaluation.accuracy,
        "scored": evaluation.scores.len(),
        "correct": evaluation.correct(),
        "skipped": evaluation.skipped,
        "by_level": evaluation.by_level,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::FetchContext { json, .. }
        | Commands::Tasks { json, .. }
        | Commands::Run { json, .. }
        | Commands::Evaluate { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_collects_agent_command_after_double_dash() {
        let cli = Cli::try_parse_from([
            "bench", "run", "--limit", "3", "--fail-fast", "--scorer", "exact", "--json", "--",
            "python", "agent.py", "--verbose",
        ])
        .expect("args should parse");
        match cli.command {
            Commands::Run {
                dataset,
                fail_fast,
                scorer,
                json,
                agent_cmd,
                ..
            } => {
                assert_eq!(dataset.limit, Some(3));
                assert!(fail_fast);
                assert_eq!(scorer.build().name(), "exact_match");
                assert!(json);
                assert_eq!(agent_cmd, vec!["python", "agent.py", "--verbose"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn dataset_args_override_config() {
        let mut dataset = DatasetConfig::default();
        apply_dataset_args(
            &mut dataset,
            &DatasetArgs {
                split: Some("dev".to_string()),
                tasks_file: None,
                limit: Some(5),
            },
        );
        assert_eq!(dataset.split, "dev");
        assert_eq!(dataset.limit, Some(5));
        assert_eq!(dataset.effective_expected_count(), None);
    }

    #[test]
    fn evaluate_rejects_both_sources() {
        let result = Cli::try_parse_from([
            "bench",
            "evaluate",
            "--run-dir",
            "a",
            "--answers",
            "b",
        ]);
        assert!(result.is_err());
    }
}
