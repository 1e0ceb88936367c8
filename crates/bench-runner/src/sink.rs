use anyhow::{anyhow, Context, Result};
use bench_core::{run_paths, AnswerRecord};
use bench_schemas::{validate_value, ANSWER_RECORD_SCHEMA};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const RUN_MANIFEST_SCHEMA_VERSION: &str = "run_manifest_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestContextFile {
    pub filename: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifestRecord {
    pub schema_version: String,
    pub run_id: String,
    pub session_id: String,
    pub created_at: String,
    pub dataset: Value,
    pub model: Value,
    pub task_count: usize,
    pub context_files: Vec<ManifestContextFile>,
}

/// Destination for the records a run produces, written as they happen.
pub trait AnswerSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()>;
    fn append_answer(&mut self, record: &AnswerRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlAnswerSink {
    run_manifest_path: PathBuf,
    answers_writer: BufWriter<File>,
}

impl JsonlAnswerSink {
    pub fn new(run_dir: &Path) -> Result<Self> {
        let paths = run_paths(run_dir);
        fs::create_dir_all(&paths.run_dir)?;
        Ok(Self {
            run_manifest_path: paths.manifest,
            answers_writer: open_append(paths.answers)?,
        })
    }
}

impl AnswerSink for JsonlAnswerSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()> {
        fs::write(&self.run_manifest_path, serde_json::to_vec_pretty(run)?)?;
        Ok(())
    }

    fn append_answer(&mut self, record: &AnswerRecord) -> Result<()> {
        serde_json::to_writer(&mut self.answers_writer, record)?;
        self.answers_writer.write_all(b"\n")?;
        // One line per finished task, so an interrupted run keeps its answers.
        self.answers_writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.answers_writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BufferedAnswerSink {
    pub manifest: Option<RunManifestRecord>,
    pub answers: Vec<AnswerRecord>,
}

impl AnswerSink for BufferedAnswerSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()> {
        self.manifest = Some(run.clone());
        Ok(())
    }

    fn append_answer(&mut self, record: &AnswerRecord) -> Result<()> {
        self.answers.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Reads an answers file (the submission format), validating each line.
pub fn read_answers(path: &Path) -> Result<Vec<AnswerRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read answers {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| anyhow!("{}:{}: invalid json: {}", path.display(), idx + 1, e))?;
        validate_value(ANSWER_RECORD_SCHEMA, &value)
            .with_context(|| format!("{}:{}", path.display(), idx + 1))?;
        records.push(serde_json::from_value(value)?);
    }
    Ok(records)
}

pub fn read_run_manifest(run_dir: &Path) -> Result<RunManifestRecord> {
    let path = run_paths(run_dir).manifest;
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read run manifest {}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}
