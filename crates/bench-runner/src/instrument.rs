use crate::agent::{field_text, AgentStep};
use bench_otel::ActiveSpan;

const MAX_ATTRIBUTE_CHARS: usize = 4096;

pub fn step_span_name(step: &AgentStep, index: usize) -> String {
    match step {
        AgentStep::Task(_) => "Task".to_string(),
        AgentStep::Planning(_) => "Planning".to_string(),
        AgentStep::Action(action) => {
            format!("Step {}", action.step_number.map(|n| n as usize).unwrap_or(index + 1))
        }
    }
}

/// Emits one child span of `parent` per recorded step, in step order.
/// Action steps that carry their own timing are backdated to it.
pub fn record_step_spans(parent: &ActiveSpan, steps: &[AgentStep]) {
    for (index, step) in steps.iter().enumerate() {
        let mut span = parent.child(step_span_name(step, index));
        span.set_attribute("step.type", step.kind());
        span.set_attribute("step.index", index);
        match step {
            AgentStep::Task(task) => {
                span.set_attribute("input.value", truncate(&task.task));
                span.end();
            }
            AgentStep::Planning(planning) => {
                if let Some(plan) = planning.plan.as_ref().and_then(field_text) {
                    span.set_attribute("output.value", truncate(&plan));
                }
                if let Some(facts) = planning.facts.as_ref().and_then(field_text) {
                    span.set_attribute("planning.facts", truncate(&facts));
                }
                span.end();
            }
            AgentStep::Action(action) => {
                if let Some(n) = action.step_number {
                    span.set_attribute("step.number", i64::from(n));
                }
                if let Some(output) = action.model_output.as_ref().and_then(field_text) {
                    span.set_attribute("output.value", truncate(&output));
                }
                if let Some(observations) = action.observations.as_ref().and_then(field_text) {
                    span.set_attribute("step.observations", truncate(&observations));
                }
                span.set_attribute("step.tool_calls", action.tool_calls.len());
                match action.error.as_ref().and_then(field_text) {
                    Some(error) => span.set_error(truncate(&error)),
                    None => span.set_ok(),
                }
                if let Some(start) = action.start_time.and_then(secs_to_unix_nano) {
                    span.set_start_unix_nano(start);
                }
                match action.end_time.and_then(secs_to_unix_nano) {
                    Some(end) => span.end_at(end),
                    None => span.end(),
                }
            }
        }
    }
}

fn secs_to_unix_nano(secs: f64) -> Option<u64> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Some((secs * 1e9) as u64)
}

pub(crate) fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_ATTRIBUTE_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ActionStep, PlanningStep, TaskStep};
    use bench_otel::{AttributeValue, InMemorySpanExporter, SimpleSpanProcessor, SpanStatus, TracerProvider};
    use serde_json::{json, Map};

    #[test]
    fn one_child_span_per_step_in_order() {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::new();
        provider.add_span_processor(SimpleSpanProcessor::new(exporter.clone()));
        let root = provider.tracer("bench").start_span("benchmark.task");
        let steps = vec![
            AgentStep::Task(TaskStep {
                task: "question".to_string(),
                memory: None,
                extra: Map::new(),
            }),
            AgentStep::Planning(PlanningStep {
                plan: Some(json!("load fees")),
                ..PlanningStep::default()
            }),
            AgentStep::Action(ActionStep {
                step_number: Some(1),
                tool_calls: vec![json!({"name": "python_interpreter"})],
                start_time: Some(1_700_000_000.0),
                end_time: Some(1_700_000_002.5),
                ..ActionStep::default()
            }),
            AgentStep::Action(ActionStep {
                step_number: Some(2),
                error: Some(json!({"type": "AgentExecutionError", "message": "NameError: df"})),
                ..ActionStep::default()
            }),
        ];
        record_step_spans(&root, &steps);
        let root_span_id = root.span_id().to_string();
        root.end();

        let spans = exporter.finished_spans();
        let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Task", "Planning", "Step 1", "Step 2", "benchmark.task"]);
        for span in &spans[..4] {
            assert_eq!(span.parent_span_id.as_deref(), Some(root_span_id.as_str()));
        }
        assert_eq!(spans[2].start_unix_nano, 1_700_000_000_000_000_000);
        assert_eq!(spans[2].end_unix_nano, 1_700_000_002_500_000_000);
        assert_eq!(spans[2].attribute("step.tool_calls"), Some(&AttributeValue::Int(1)));
        assert_eq!(spans[2].status, SpanStatus::Ok);
        assert_eq!(spans[3].status, SpanStatus::Error);
        assert_eq!(spans[3].status_message.as_deref(), Some("AgentExecutionError: NameError: df"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_ATTRIBUTE_CHARS + 10);
        let cut = truncate(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), MAX_ATTRIBUTE_CHARS + 3);
        assert_eq!(truncate("short"), "short");
    }
}
