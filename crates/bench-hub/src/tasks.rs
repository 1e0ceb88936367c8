use anyhow::{anyhow, Context, Result};
use bench_core::Task;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::info;

/// Loads tasks from a local `.jsonl` file (one task per line) or a `.json`
/// file holding an array of tasks.
pub fn load_tasks_file(path: &Path) -> Result<Vec<Task>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read tasks file {}", path.display()))?;
    let is_json_array = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
        || raw.trim_start().starts_with('[');

    let tasks = if is_json_array {
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        let rows = value
            .as_array()
            .ok_or_else(|| anyhow!("{} must contain a JSON array of tasks", path.display()))?;
        rows.iter()
            .enumerate()
            .map(|(idx, row)| {
                serde_json::from_value::<Task>(row.clone())
                    .with_context(|| format!("failed to parse task {} in {}", idx, path.display()))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        let mut tasks = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let task: Task = serde_json::from_str(line).with_context(|| {
                format!("failed to parse task on line {} of {}", idx + 1, path.display())
            })?;
            tasks.push(task);
        }
        tasks
    };
    info!(path = %path.display(), count = tasks.len(), "loaded tasks from file");
    Ok(tasks)
}

pub fn check_task_count(tasks: &[Task], expected: Option<usize>) -> Result<()> {
    if let Some(expected) = expected {
        if tasks.len() != expected {
            return Err(anyhow!(
                "Number of tasks is not correct: expected {}, got {}",
                expected,
                tasks.len()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file(label: &str, ext: &str, contents: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("bench_hub_tasks_{}_{}.{}", label, nanos, ext));
        fs::write(&path, contents).expect("write tasks file");
        path
    }

    #[test]
    fn loads_jsonl_and_skips_blank_lines() {
        let path = temp_file(
            "jsonl",
            "jsonl",
            "{\"task_id\": 1, \"question\": \"a\", \"guidelines\": \"g\", \"answer\": \"1\"}\n\n{\"task_id\": 2, \"question\": \"b\", \"guidelines\": \"g\"}\n",
        );
        let tasks = load_tasks_file(&path).expect("tasks should load");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].answer.as_deref(), Some("1"));
        assert_eq!(tasks[1].task_id, "2");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn loads_json_array() {
        let path = temp_file(
            "array",
            "json",
            r#"[{"task_id": "a", "question": "q", "guidelines": "g", "level": "hard"}]"#,
        );
        let tasks = load_tasks_file(&path).expect("tasks should load");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].level.as_deref(), Some("hard"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn reports_line_of_malformed_task() {
        let path = temp_file("bad", "jsonl", "{\"task_id\": 1, \"question\": \"a\"}\n{not json}\n");
        let err = load_tasks_file(&path).expect_err("bad line should fail");
        assert!(format!("{:#}", err).contains("line 2"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn task_count_check_is_optional() {
        let tasks = Vec::new();
        check_task_count(&tasks, None).expect("no expectation");
        assert!(check_task_count(&tasks, Some(450)).is_err());
    }
}
