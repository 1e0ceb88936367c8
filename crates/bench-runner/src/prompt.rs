use std::path::Path;

pub const PROMPT_TEMPLATE: &str = "You are an expert data analyst and you will answer factoid questions by loading and referencing the files/documents listed below.
You have these files available:
{context_files}
Don't forget to reference any documentation in the data dir before answering a question.

Here is the question you need to answer:
{question}

Here are the guidelines you must follow when answering the question above:
{guidelines}
";

/// Renders the file list the way the agent has always seen it: a bracketed,
/// single-quoted, comma-separated list.
pub fn render_file_list<P: AsRef<Path>>(context_files: &[P]) -> String {
    let items: Vec<String> = context_files
        .iter()
        .map(|p| format!("'{}'", p.as_ref().display()))
        .collect();
    format!("[{}]", items.join(", "))
}

pub fn build_prompt<P: AsRef<Path>>(context_files: &[P], question: &str, guidelines: &str) -> String {
    // Substitute in one pass so placeholder-looking text inside a question
    // is never expanded.
    let mut out = String::with_capacity(PROMPT_TEMPLATE.len() + question.len() + guidelines.len());
    let mut rest = PROMPT_TEMPLATE;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let (value, consumed) = if tail.starts_with("{context_files}") {
            (render_file_list(context_files), "{context_files}".len())
        } else if tail.starts_with("{question}") {
            (question.to_string(), "{question}".len())
        } else if tail.starts_with("{guidelines}") {
            (guidelines.to_string(), "{guidelines}".len())
        } else {
            ("{".to_string(), 1)
        };
        out.push_str(&value);
        rest = &tail[consumed..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn files() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/tmp/DABstep-data/data/context/fees.json"),
            PathBuf::from("/tmp/DABstep-data/data/context/manual.md"),
        ]
    }

    #[test]
    fn prompt_substitutes_all_three_parts() {
        let prompt = build_prompt(&files(), "What is the fee?", "Round to 2 decimals");
        assert!(prompt.starts_with("You are an expert data analyst"));
        assert!(prompt.contains(
            "['/tmp/DABstep-data/data/context/fees.json', '/tmp/DABstep-data/data/context/manual.md']"
        ));
        assert!(prompt.contains("Here is the question you need to answer:\nWhat is the fee?\n"));
        assert!(prompt.ends_with(
            "Here are the guidelines you must follow when answering the question above:\nRound to 2 decimals\n"
        ));
        assert!(!prompt.contains("{question}"));
    }

    #[test]
    fn prompt_is_deterministic() {
        let a = build_prompt(&files(), "q", "g");
        let b = build_prompt(&files(), "q", "g");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_inputs_are_substituted_as_is() {
        let empty: Vec<PathBuf> = Vec::new();
        let prompt = build_prompt(&empty, "", "");
        assert!(prompt.contains("You have these files available:\n[]\n"));
        assert!(prompt.contains("answer:\n\n\nHere are"));
    }

    #[test]
    fn placeholders_inside_inputs_are_not_expanded() {
        let prompt = build_prompt(&files(), "literal {guidelines} text", "g");
        assert!(prompt.contains("literal {guidelines} text"));
    }
}
