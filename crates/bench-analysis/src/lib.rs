use anyhow::Result;
use bench_core::{atomic_write_bytes, atomic_write_json_pretty, file_timestamp, AnswerRecord, ScoreRecord, Task};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

mod scorer;

pub use scorer::{factoid_match, ExactMatchScorer, FactoidScorer, Scorer};

const UNKNOWN_LEVEL: &str = "unknown";
const CELL_MAX_CHARS: usize = 40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("answer references unknown task_id {task_id}")]
    UnknownTask { task_id: String },
    #[error("task_id {task_id} is answered more than once")]
    DuplicateAnswer { task_id: String },
    #[error("task {task_id} has no ground truth answer (hidden split?)")]
    MissingGroundTruth { task_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSummary {
    pub count: usize,
    pub correct: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub scorer: String,
    pub scores: Vec<ScoreRecord>,
    pub accuracy: f64,
    /// Tasks that had no answer in this run.
    pub skipped: usize,
    pub by_level: BTreeMap<String, LevelSummary>,
}

impl Evaluation {
    pub fn correct(&self) -> f64 {
        self.scores.iter().map(|s| s.score).sum()
    }
}

pub fn mean_accuracy(scores: &[ScoreRecord]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64
}

/// Scores every answer against the task it names. Answers are scored in
/// their own order; tasks nobody answered are only counted as skipped.
pub fn evaluate(answers: &[AnswerRecord], tasks: &[Task], scorer: &dyn Scorer) -> Result<Evaluation> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(answers.len());
    let mut scores = Vec::with_capacity(answers.len());

    for answer in answers {
        let task = by_id
            .get(answer.task_id.as_str())
            .copied()
            .ok_or_else(|| EvalError::UnknownTask {
                task_id: answer.task_id.clone(),
            })?;
        if !seen.insert(answer.task_id.as_str()) {
            return Err(EvalError::DuplicateAnswer {
                task_id: answer.task_id.clone(),
            }
            .into());
        }
        let truth = task
            .answer
            .as_deref()
            .ok_or_else(|| EvalError::MissingGroundTruth {
                task_id: task.task_id.clone(),
            })?;
        scores.push(ScoreRecord {
            task_id: answer.task_id.clone(),
            agent_answer: answer.agent_answer.clone(),
            score: scorer.score(&answer.agent_answer, truth),
            correct_answer: truth.to_string(),
            question: task.question.clone(),
            level: task.level.clone(),
            trace_id: answer.trace_id.clone(),
        });
    }

    let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for score in &scores {
        let level = score.level.clone().unwrap_or_else(|| UNKNOWN_LEVEL.to_string());
        grouped.entry(level).or_default().push(score.score);
    }
    let by_level = grouped
        .into_iter()
        .map(|(level, values)| {
            let correct: f64 = values.iter().sum();
            let summary = LevelSummary {
                count: values.len(),
                correct,
                accuracy: correct / values.len() as f64,
            };
            (level, summary)
        })
        .collect();

    let accuracy = mean_accuracy(&scores);
    let skipped = tasks.len().saturating_sub(seen.len());
    info!(
        scorer = scorer.name(),
        scored = scores.len(),
        skipped,
        accuracy,
        "evaluation finished"
    );
    Ok(Evaluation {
        scorer: scorer.name().to_string(),
        scores,
        accuracy,
        skipped,
        by_level,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub created_at: String,
    pub scorer: String,
    pub accuracy: f64,
    pub scored: usize,
    pub correct: f64,
    pub skipped: usize,
    pub by_level: BTreeMap<String, LevelSummary>,
    pub scores_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreTablePaths {
    pub scores: PathBuf,
    pub summary: PathBuf,
}

/// Persists the per-task score table as JSONL next to a summary document,
/// both stamped with the same timestamp.
pub fn write_score_table(dir: &Path, evaluation: &Evaluation) -> Result<ScoreTablePaths> {
    let stamp = file_timestamp();
    let scores_path = dir.join(format!("scores_{}.jsonl", stamp));
    let summary_path = dir.join(format!("summary_{}.json", stamp));

    let mut body = Vec::new();
    for score in &evaluation.scores {
        serde_json::to_writer(&mut body, score)?;
        body.push(b'\n');
    }
    atomic_write_bytes(&scores_path, &body)?;
    atomic_write_json_pretty(
        &summary_path,
        &EvaluationSummary {
            created_at: Utc::now().to_rfc3339(),
            scorer: evaluation.scorer.clone(),
            accuracy: evaluation.accuracy,
            scored: evaluation.scores.len(),
            correct: evaluation.correct(),
            skipped: evaluation.skipped,
            by_level: evaluation.by_level.clone(),
            scores_file: scores_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        },
    )?;
    info!(scores = %scores_path.display(), summary = %summary_path.display(), "score table written");
    Ok(ScoreTablePaths {
        scores: scores_path,
        summary: summary_path,
    })
}

pub fn render_score_table(evaluation: &Evaluation) -> String {
    let columns = ["task_id", "level", "score", "agent_answer", "correct_answer"];
    let rows: Vec<[String; 5]> = evaluation
        .scores
        .iter()
        .map(|s| {
            [
                s.task_id.clone(),
                s.level.clone().unwrap_or_else(|| UNKNOWN_LEVEL.to_string()),
                format!("{:.1}", s.score),
                truncate_cell(&s.agent_answer),
                truncate_cell(&s.correct_answer),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header = columns
        .iter()
        .enumerate()
        .map(|(idx, col)| pad_cell(col, widths[idx], idx == 2))
        .collect::<Vec<_>>()
        .join(" | ");
    out.push_str(&header);
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.push('\n');
    for row in &rows {
        let line = row
            .iter()
            .enumerate()
            .map(|(idx, cell)| pad_cell(cell, widths[idx], idx == 2))
            .collect::<Vec<_>>()
            .join(" | ");
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(&format!(
        "accuracy: {:.4} ({}/{} correct, {} skipped)\n",
        evaluation.accuracy,
        evaluation.correct(),
        evaluation.scores.len(),
        evaluation.skipped
    ));
    for (level, summary) in &evaluation.by_level {
        out.push_str(&format!(
            "  {}: {:.4} ({}/{})\n",
            level, summary.accuracy, summary.correct, summary.count
        ));
    }
    out
}

fn truncate_cell(value: &str) -> String {
    let flat = value.replace('\n', " ");
    if flat.chars().count() <= CELL_MAX_CHARS {
        return flat;
    }
    let kept: String = flat.chars().take(CELL_MAX_CHARS - 3).collect();
    format!("{}...", kept)
}

fn pad_cell(value: &str, width: usize, right_align: bool) -> String {
    let value_len = value.chars().count();
    if value_len >= width {
        value.to_string()
    } else if right_align {
        format!("{:padding$}{value}", "", padding = width - value_len)
    } else {
        format!("{value}{:padding$}", "", padding = width - value_len)
    }
}
