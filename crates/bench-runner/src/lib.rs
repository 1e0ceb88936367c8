mod agent;
mod command_agent;
mod config;
mod instrument;
mod prompt;
mod runner;
mod sink;

pub use agent::{
    field_text, sanitize_steps, serialize_trace, ActionStep, Agent, AgentRun, AgentStep, PlanningStep,
    TaskStep,
};
pub use command_agent::{read_agent_output, AgentError, AgentInput, CommandAgent};
pub use config::{
    load_config, validate_config, AgentConfig, BenchConfig, ContextConfig, DatasetConfig,
    FailurePolicy, ModelSettings, OutputConfig, TracingConfig,
};
pub use instrument::{record_step_spans, step_span_name};
pub use prompt::{build_prompt, render_file_list, PROMPT_TEMPLATE};
pub use runner::{
    execute_run, new_session_id, run_benchmark, RunOptions, RunResult, RunSetup, TASK_SPAN_NAME,
};
pub use sink::{
    read_answers, read_run_manifest, AnswerSink, BufferedAnswerSink, JsonlAnswerSink,
    ManifestContextFile, RunManifestRecord, RUN_MANIFEST_SCHEMA_VERSION,
};
