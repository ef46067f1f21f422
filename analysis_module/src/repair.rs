//! Layered recovery for model output that should be a single JSON object.
//!
//! Strategies are tried in order and the first success wins. Each one is a
//! pure function so they stay testable on their own.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

pub type ParseStrategy = fn(&str) -> Option<Value>;

/// Ordered parse strategies: direct parse, fenced code block, then the
/// substring between the first `{` and the last `}`.
pub const STRATEGIES: [(&str, ParseStrategy); 3] = [
    ("direct", parse_direct),
    ("fenced", parse_fenced),
    ("braced", parse_braced),
];

/// Parse model output as JSON, repairing common wrappers.
///
/// Returns `None` when no strategy yields a JSON object.
pub fn parse_llm_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    for (name, strategy) in STRATEGIES {
        if let Some(value) = strategy(trimmed) {
            if value.is_object() {
                tracing::debug!("parsed model output via {} strategy", name);
                return Some(value);
            }
        }
    }
    None
}

pub fn parse_direct(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

pub fn parse_fenced(text: &str) -> Option<Value> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?is)```(?:json)?\s*(.*?)\s*```").unwrap());
    let inner = re.captures(text)?.get(1)?.as_str();
    serde_json::from_str(inner).ok()
}

pub fn parse_braced(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BARE: &str = r#"{"meeting_intent": true, "meeting_time": "2025-11-07 14:00"}"#;

    #[test]
    fn direct_strategy_parses_bare_json() {
        let value = parse_direct(BARE).expect("direct parse");
        assert_eq!(value["meeting_intent"], true);
    }

    #[test]
    fn fenced_strategy_strips_code_fences() {
        let wrapped = format!("```json\n{}\n```", BARE);
        let value = parse_fenced(&wrapped).expect("fenced parse");
        assert_eq!(value["meeting_time"], "2025-11-07 14:00");

        let unlabeled = format!("```\n{}\n```", BARE);
        assert!(parse_fenced(&unlabeled).is_some());
    }

    #[test]
    fn braced_strategy_trims_surrounding_prose() {
        let noisy = format!("Here is the result:\n{}\nHope that helps!", BARE);
        let value = parse_braced(&noisy).expect("braced parse");
        assert_eq!(value["meeting_intent"], true);
    }

    #[test]
    fn cascade_matches_bare_json_for_all_wrappers() {
        let bare = parse_llm_json(BARE).expect("bare");
        let fenced = parse_llm_json(&format!("```json\n{}\n```", BARE)).expect("fenced");
        let noisy = parse_llm_json(&format!("prose {} trailing", BARE)).expect("noisy");
        assert_eq!(bare, fenced);
        assert_eq!(bare, noisy);
    }

    #[test]
    fn unrecoverable_output_returns_none() {
        assert!(parse_llm_json("").is_none());
        assert!(parse_llm_json("no json here").is_none());
        assert!(parse_llm_json("{broken").is_none());
        // a bare array is not the expected object shape
        assert!(parse_llm_json("[1, 2]").is_none());
    }
}
