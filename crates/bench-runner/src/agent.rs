use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One call into an agent framework: a prompt in, a final answer plus the
/// framework's step log out. Any internal iteration (tool calls, model
/// round-trips, retries) happens behind this call.
pub trait Agent {
    fn run(&mut self, prompt: &str) -> Result<AgentRun>;
}

impl<A: Agent + ?Sized> Agent for Box<A> {
    fn run(&mut self, prompt: &str) -> Result<AgentRun> {
        (**self).run(prompt)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentRun {
    pub answer: String,
    #[serde(default)]
    pub steps: Vec<AgentStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStep {
    Task(TaskStep),
    Planning(PlanningStep),
    Action(ActionStep),
}

// Step payloads come from arbitrary agent frameworks. Free-form fields stay
// `Value`, and typed scalars fall back to their default when the framework
// sends null or some other shape, so a step never sinks the whole run.

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskStep {
    #[serde(default, deserialize_with = "lenient")]
    pub task: String,
    #[serde(default)]
    pub memory: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanningStep {
    #[serde(default)]
    pub plan: Option<Value>,
    #[serde(default)]
    pub facts: Option<Value>,
    #[serde(default)]
    pub memory: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionStep {
    #[serde(default, deserialize_with = "lenient")]
    pub step_number: Option<u32>,
    #[serde(default)]
    pub model_output: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub tool_calls: Vec<Value>,
    #[serde(default)]
    pub observations: Option<Value>,
    /// Either a message string or a structured error such as
    /// `{"type": "AgentExecutionError", "message": "..."}`.
    #[serde(default)]
    pub error: Option<Value>,
    /// Seconds since the unix epoch, as reported by the agent framework.
    #[serde(default, deserialize_with = "lenient")]
    pub start_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub memory: Option<Value>,
    #[serde(default)]
    pub agent_memory: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Flattens a loosely typed step field into display text. Null counts as
/// absent; structured errors render as `type: message`.
pub fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => Some(match map.get("type").and_then(Value::as_str) {
                Some(kind) => format!("{}: {}", kind, message),
                None => message.to_string(),
            }),
            None => Some(value.to_string()),
        },
        other => Some(other.to_string()),
    }
}

impl AgentStep {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Planning(_) => "planning",
            Self::Action(_) => "action",
        }
    }

    /// Drops the bulky memory snapshots; identity and content fields stay.
    pub fn clear_bulk_fields(&mut self) {
        match self {
            Self::Task(step) => step.memory = None,
            Self::Planning(step) => step.memory = None,
            Self::Action(step) => {
                step.memory = None;
                step.agent_memory = None;
            }
        }
    }
}

pub fn sanitize_steps(mut steps: Vec<AgentStep>) -> Vec<AgentStep> {
    for step in &mut steps {
        step.clear_bulk_fields();
    }
    steps
}

pub fn serialize_trace(steps: &[AgentStep]) -> Result<String> {
    Ok(serde_json::to_string(steps)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mixed_steps() -> Vec<AgentStep> {
        vec![
            AgentStep::Task(TaskStep {
                task: "answer q".to_string(),
                memory: Some(json!({"messages": ["big"]})),
                extra: Map::new(),
            }),
            AgentStep::Planning(PlanningStep {
                plan: Some(json!("1. load csv")),
                facts: Some(json!("fees.json exists")),
                memory: Some(json!(["planning memory"])),
                extra: Map::new(),
            }),
            AgentStep::Action(ActionStep {
                step_number: Some(1),
                model_output: Some(json!("df = pd.read_csv(...)")),
                tool_calls: vec![json!({"name": "python_interpreter"})],
                observations: Some(json!("1000 rows")),
                memory: Some(json!({"state": "large"})),
                agent_memory: Some(json!([{"role": "user", "content": "..."}])),
                ..ActionStep::default()
            }),
            AgentStep::Action(ActionStep {
                step_number: Some(2),
                model_output: Some(json!("final_answer('42')")),
                agent_memory: Some(json!(["second"])),
                ..ActionStep::default()
            }),
        ]
    }

    #[test]
    fn sanitize_clears_memory_on_every_step() {
        let steps = sanitize_steps(mixed_steps());
        for step in &steps {
            match step {
                AgentStep::Task(s) => assert!(s.memory.is_none()),
                AgentStep::Planning(s) => assert!(s.memory.is_none()),
                AgentStep::Action(s) => {
                    assert!(s.memory.is_none());
                    assert!(s.agent_memory.is_none());
                }
            }
        }
    }

    #[test]
    fn sanitize_preserves_order_length_and_other_fields() {
        let original = mixed_steps();
        let sanitized = sanitize_steps(original.clone());
        assert_eq!(sanitized.len(), original.len());
        let kinds: Vec<&str> = sanitized.iter().map(AgentStep::kind).collect();
        assert_eq!(kinds, vec!["task", "planning", "action", "action"]);

        match (&original[1], &sanitized[1]) {
            (AgentStep::Planning(before), AgentStep::Planning(after)) => {
                assert_eq!(before.plan, after.plan);
                assert_eq!(before.facts, after.facts);
            }
            _ => panic!("planning step moved"),
        }
        match (&original[2], &sanitized[2]) {
            (AgentStep::Action(before), AgentStep::Action(after)) => {
                assert_eq!(before.step_number, after.step_number);
                assert_eq!(before.model_output, after.model_output);
                assert_eq!(before.tool_calls, after.tool_calls);
                assert_eq!(before.observations, after.observations);
            }
            _ => panic!("action step moved"),
        }
    }

    #[test]
    fn steps_round_trip_through_tagged_json_and_keep_unknown_fields() {
        let raw = json!([
            {"type": "task", "task": "t", "memory": {"x": 1}, "task_images": null},
            {"type": "action", "step_number": 3, "agent_memory": ["m"], "duration": 1.5}
        ]);
        let steps: Vec<AgentStep> = serde_json::from_value(raw).expect("steps should parse");
        let sanitized = sanitize_steps(steps);
        let text = serialize_trace(&sanitized).expect("serialize");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value[0]["type"], "task");
        assert!(value[0]["memory"].is_null());
        assert!(value[0].as_object().expect("object").contains_key("task_images"));
        assert_eq!(value[1]["step_number"], 3);
        assert!(value[1]["agent_memory"].is_null());
        assert_eq!(value[1]["duration"], 1.5);
    }

    #[test]
    fn loosely_shaped_fields_still_parse() {
        let raw = json!([
            {"type": "task", "task": null},
            {"type": "planning", "plan": null, "facts": {"known": ["fees.json"]}},
            {
                "type": "action",
                "step_number": "2",
                "tool_calls": null,
                "model_output": ["chunk"],
                "error": {"type": "AgentExecutionError", "message": "boom"},
                "start_time": null
            }
        ]);
        let steps: Vec<AgentStep> = serde_json::from_value(raw).expect("steps should parse");
        match &steps[0] {
            AgentStep::Task(task) => assert_eq!(task.task, ""),
            other => panic!("unexpected step: {:?}", other),
        }
        match &steps[1] {
            AgentStep::Planning(planning) => {
                assert_eq!(planning.plan, None);
                assert_eq!(planning.facts, Some(json!({"known": ["fees.json"]})));
            }
            other => panic!("unexpected step: {:?}", other),
        }
        match &steps[2] {
            AgentStep::Action(action) => {
                assert_eq!(action.step_number, None);
                assert!(action.tool_calls.is_empty());
                assert_eq!(action.start_time, None);
                let error = action.error.as_ref().and_then(field_text);
                assert_eq!(error.as_deref(), Some("AgentExecutionError: boom"));
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn field_text_renders_each_shape() {
        assert_eq!(field_text(&Value::Null), None);
        assert_eq!(field_text(&json!("plain")).as_deref(), Some("plain"));
        assert_eq!(field_text(&json!({"message": "only"})).as_deref(), Some("only"));
        assert_eq!(field_text(&json!({"code": 1})).as_deref(), Some(r#"{"code":1}"#));
        assert_eq!(field_text(&json!(3)).as_deref(), Some("3"));
    }
}
