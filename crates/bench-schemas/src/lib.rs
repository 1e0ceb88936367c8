use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

pub const AGENT_INPUT_SCHEMA: &str = "agent_input_v1.jsonschema";
pub const AGENT_RUN_SCHEMA: &str = "agent_run_v1.jsonschema";
pub const ANSWER_RECORD_SCHEMA: &str = "answer_record_v1.jsonschema";

pub fn schema_names() -> Vec<String> {
    SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Dev fallback: allow newly added schema files before this crate is rebuilt.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)?;
    Ok(compiled)
}

/// Compiles each schema once per process; later lookups reuse it.
pub fn cached_schema(name: &str) -> Result<&'static JSONSchema> {
    static CACHE: OnceLock<Mutex<HashMap<String, &'static JSONSchema>>> = OnceLock::new();
    let mut cache = CACHE
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .map_err(|_| anyhow!("schema cache poisoned"))?;
    if let Some(compiled) = cache.get(name) {
        return Ok(*compiled);
    }
    let compiled: &'static JSONSchema = Box::leak(Box::new(compile_schema(name)?));
    cache.insert(name.to_string(), compiled);
    Ok(compiled)
}

/// Validates `value` against the named schema, joining every violation into
/// a single error message.
pub fn validate_value(name: &str, value: &Value) -> Result<()> {
    let compiled = cached_schema(name)?;
    let result = compiled.validate(value);
    if let Err(errors) = result {
        let messages: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(anyhow!(
            "document does not match {}: {}",
            name,
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bundled_schemas_are_listed() {
        let names = schema_names();
        assert!(names.contains(&AGENT_RUN_SCHEMA.to_string()));
        assert!(names.contains(&AGENT_INPUT_SCHEMA.to_string()));
        assert!(names.contains(&ANSWER_RECORD_SCHEMA.to_string()));
    }

    #[test]
    fn agent_run_requires_answer_and_known_step_types() {
        validate_value(
            AGENT_RUN_SCHEMA,
            &json!({"answer": "42", "steps": [{"type": "action"}]}),
        )
        .expect("valid run");
        let err = validate_value(AGENT_RUN_SCHEMA, &json!({"steps": []}))
            .expect_err("missing answer should fail");
        assert!(err.to_string().contains("agent_run_v1"));
        assert!(validate_value(
            AGENT_RUN_SCHEMA,
            &json!({"answer": "x", "steps": [{"type": "reflection"}]})
        )
        .is_err());
    }

    #[test]
    fn repeated_lookups_share_one_compiled_schema() {
        let first = cached_schema(ANSWER_RECORD_SCHEMA).expect("compile");
        let second = cached_schema(ANSWER_RECORD_SCHEMA).expect("cached");
        assert!(std::ptr::eq(first, second));
        assert!(cached_schema("missing_v1.jsonschema").is_err());
    }

    #[test]
    fn answer_record_rejects_empty_task_id() {
        assert!(validate_value(
            ANSWER_RECORD_SCHEMA,
            &json!({"task_id": "", "agent_answer": "a", "reasoning_trace": "[]"})
        )
        .is_err());
    }
}
