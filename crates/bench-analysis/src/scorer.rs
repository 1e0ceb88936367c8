use regex::Regex;
use similar::TextDiff;
use std::collections::BTreeSet;
use std::sync::OnceLock;

const SIMILARITY_THRESHOLD: f32 = 0.95;
const REL_TOLERANCE: f64 = 1e-4;
const ABS_TOLERANCE: f64 = 1e-9;

/// Compares one agent answer against its ground truth.
pub trait Scorer {
    fn name(&self) -> &str;
    fn score(&self, agent_answer: &str, ground_truth: &str) -> f64;
}

/// Trimmed, case-insensitive equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchScorer;

impl Scorer for ExactMatchScorer {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn score(&self, agent_answer: &str, ground_truth: &str) -> f64 {
        bool_score(agent_answer.trim().to_lowercase() == ground_truth.trim().to_lowercase())
    }
}

/// DABstep factoid scoring: numbers compare with a tolerance, `,`/`;` lists
/// compare item by item regardless of order, and free text compares after
/// punctuation is removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactoidScorer;

impl Scorer for FactoidScorer {
    fn name(&self) -> &str {
        "factoid"
    }

    fn score(&self, agent_answer: &str, ground_truth: &str) -> f64 {
        bool_score(factoid_match(agent_answer, ground_truth))
    }
}

fn bool_score(matched: bool) -> f64 {
    if matched {
        1.0
    } else {
        0.0
    }
}

pub fn factoid_match(agent_answer: &str, ground_truth: &str) -> bool {
    let agent = agent_answer.trim().to_lowercase();
    let truth = ground_truth.trim().to_lowercase();

    if let (Some(a), Some(t)) = (parse_number(&agent), parse_number(&truth)) {
        return numbers_match(a, t);
    }
    if is_list(&agent) || is_list(&truth) {
        return lists_match(&agent, &truth);
    }
    strings_match(&agent, &truth)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ParsedNumber {
    value: f64,
    percent: bool,
}

fn number_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^([-+]?)\$?((?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?|\.\d+)(%?)$").ok()
        })
        .as_ref()
}

fn parse_number(text: &str) -> Option<ParsedNumber> {
    let caps = number_pattern()?.captures(text)?;
    let digits = caps.get(2)?.as_str().replace(',', "");
    let mut value: f64 = digits.parse().ok()?;
    if caps.get(1).map(|m| m.as_str()) == Some("-") {
        value = -value;
    }
    Some(ParsedNumber {
        value,
        percent: caps.get(3).map(|m| !m.as_str().is_empty()).unwrap_or(false),
    })
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= ABS_TOLERANCE.max(REL_TOLERANCE * a.abs().max(b.abs()))
}

fn numbers_match(agent: ParsedNumber, truth: ParsedNumber) -> bool {
    if close(agent.value, truth.value) {
        return true;
    }
    // "51%" and "0.51" name the same quantity.
    match (agent.percent, truth.percent) {
        (true, false) => close(agent.value / 100.0, truth.value),
        (false, true) => close(agent.value, truth.value / 100.0),
        _ => false,
    }
}

fn is_list(text: &str) -> bool {
    text.contains(',') || text.contains(';')
}

fn split_list(text: &str) -> Vec<&str> {
    text.split(|c| c == ',' || c == ';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn items_match(agent: &str, truth: &str) -> bool {
    match (parse_number(agent), parse_number(truth)) {
        (Some(a), Some(t)) => numbers_match(a, t),
        _ => strings_match(agent, truth),
    }
}

/// Multiset comparison: every truth item claims a distinct agent item.
fn lists_match(agent: &str, truth: &str) -> bool {
    let mut remaining = split_list(agent);
    let truth_items = split_list(truth);
    if remaining.len() != truth_items.len() {
        return false;
    }
    for t in truth_items {
        match remaining.iter().position(|a| items_match(a, t)) {
            Some(i) => {
                remaining.swap_remove(i);
            }
            None => return false,
        }
    }
    true
}

fn clean_text(text: &str) -> String {
    let kept: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strings_match(agent: &str, truth: &str) -> bool {
    let agent = clean_text(agent);
    let truth = clean_text(truth);
    if agent == truth {
        return true;
    }

    let agent_words: BTreeSet<&str> = agent.split(' ').filter(|w| !w.is_empty()).collect();
    let truth_words: BTreeSet<&str> = truth.split(' ').filter(|w| !w.is_empty()).collect();
    if !truth_words.is_empty() && truth_words.is_subset(&agent_words) {
        return true;
    }

    TextDiff::from_chars(agent.as_str(), truth.as_str()).ratio() > SIMILARITY_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factoid(agent: &str, truth: &str) -> f64 {
        FactoidScorer.score(agent, truth)
    }

    #[test]
    fn numbers_compare_with_tolerance_and_formatting() {
        assert_eq!(factoid("0.51", "0.51"), 1.0);
        assert_eq!(factoid(" 0.510 ", "0.51"), 1.0);
        assert_eq!(factoid("1,234.5", "1234.5"), 1.0);
        assert_eq!(factoid("$100", "100"), 1.0);
        assert_eq!(factoid("-3", "-3.0"), 1.0);
        assert_eq!(factoid("0.5", "0.51"), 0.0);
        assert_eq!(factoid("-3", "3"), 0.0);
    }

    #[test]
    fn percentages_match_their_fraction() {
        assert_eq!(factoid("51%", "0.51"), 1.0);
        assert_eq!(factoid("0.51", "51%"), 1.0);
        assert_eq!(factoid("51%", "51"), 1.0);
        assert_eq!(factoid("50%", "0.51"), 0.0);
    }

    #[test]
    fn lists_ignore_order_and_separator() {
        assert_eq!(factoid("A, B; C", "c,b,a"), 1.0);
        assert_eq!(factoid("1.0, 2", "2, 1"), 1.0);
        assert_eq!(factoid("a, b", "a"), 0.0);
        assert_eq!(factoid("a, b", "a, c"), 0.0);
        assert_eq!(factoid("a, a", "a, b"), 0.0);
    }

    #[test]
    fn list_items_use_scalar_number_rules() {
        assert_eq!(factoid("50%, 7%", "0.5, 0.07"), 1.0);
        assert_eq!(factoid("7%, 50%", "0.5, 0.07"), 1.0);
        assert_eq!(factoid("$5, 10", "5, 10"), 1.0);
        assert_eq!(factoid("$5, 10", "10, 6"), 0.0);
    }

    #[test]
    fn strings_ignore_case_and_punctuation() {
        assert_eq!(factoid("Yes.", "yes"), 1.0);
        assert_eq!(factoid("NexPay", "nexpay"), 1.0);
        assert_eq!(factoid("The answer is GlobalCard", "GlobalCard"), 1.0);
        assert_eq!(factoid("visa", "mastercard"), 0.0);
        assert_eq!(factoid("", "1"), 0.0);
    }

    #[test]
    fn near_identical_strings_pass_similarity() {
        assert_eq!(
            factoid("Crossfit_Hanna_Merchant_Acount", "crossfit_hanna_merchant_account"),
            1.0
        );
        assert_eq!(factoid("belles", "rafa"), 0.0);
    }

    #[test]
    fn exact_match_only_trims_and_lowercases() {
        assert_eq!(ExactMatchScorer.score(" Yes ", "yes"), 1.0);
        assert_eq!(ExactMatchScorer.score("yes.", "yes"), 0.0);
        assert_eq!(ExactMatchScorer.name(), "exact_match");
        assert_eq!(FactoidScorer.name(), "factoid");
    }
}
