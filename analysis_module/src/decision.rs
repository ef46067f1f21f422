//! Structured result of analyzing one thread.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

/// Whether the analysis itself completed. `Error` carries a short reason
/// tag such as `gemini_quota_exceeded` or `llm_output_unparsable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionStatus {
    Ok,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub status: DecisionStatus,
    pub meeting_intent: Option<bool>,
    pub meeting_subject: String,
    /// Canonical `YYYY-MM-DD HH:MM`, local/naive. Empty when unknown.
    pub meeting_time: String,
    pub attendees: Vec<String>,
    pub confidence: Confidence,
    pub clarify_needed: bool,
    pub clarify_reason: String,
    pub reasoning: String,
}

impl Decision {
    /// Synthetic result for a failed model call or unparsable output.
    pub fn error(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Decision {
            status: DecisionStatus::Error(reason.into()),
            meeting_intent: None,
            meeting_subject: String::new(),
            meeting_time: String::new(),
            attendees: Vec::new(),
            confidence: Confidence::Low,
            clarify_needed: true,
            clarify_reason: "LLM call failed".to_string(),
            reasoning: detail.into(),
        }
    }

    /// Lenient extraction from the repaired JSON value. Missing or
    /// mistyped fields degrade to neutral defaults rather than failing.
    pub fn from_value(value: &Value) -> Self {
        let as_str = |key: &str| -> String {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let attendees = value
            .get("attendees")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Decision {
            status: DecisionStatus::Ok,
            meeting_intent: value.get("meeting_intent").and_then(Value::as_bool),
            meeting_subject: as_str("meeting_subject"),
            meeting_time: as_str("meeting_time"),
            attendees,
            confidence: Confidence::from_label(&as_str("confidence")),
            clarify_needed: value
                .get("clarify_needed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            clarify_reason: as_str("clarify_reason"),
            reasoning: as_str("reasoning"),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, DecisionStatus::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_all_fields() {
        let value = json!({
            "meeting_intent": true,
            "meeting_subject": "Project sync",
            "meeting_time": " 2025-11-07 14:00 ",
            "attendees": ["a@example.com", "  ", "b@example.com"],
            "confidence": "High",
            "clarify_needed": false,
            "clarify_reason": "",
            "reasoning": "cross-participant acceptance"
        });
        let decision = Decision::from_value(&value);
        assert_eq!(decision.status, DecisionStatus::Ok);
        assert_eq!(decision.meeting_intent, Some(true));
        assert_eq!(decision.meeting_time, "2025-11-07 14:00");
        assert_eq!(decision.attendees, vec!["a@example.com", "b@example.com"]);
        assert_eq!(decision.confidence, Confidence::High);
        assert!(!decision.clarify_needed);
    }

    #[test]
    fn missing_fields_degrade_to_defaults() {
        let decision = Decision::from_value(&json!({}));
        assert_eq!(decision.status, DecisionStatus::Ok);
        assert_eq!(decision.meeting_intent, None);
        assert!(decision.meeting_time.is_empty());
        assert!(decision.attendees.is_empty());
        assert_eq!(decision.confidence, Confidence::Low);
        assert!(!decision.clarify_needed);
    }

    #[test]
    fn error_decision_requests_clarification() {
        let decision = Decision::error("gemini_quota_exceeded", "quota hit");
        assert!(decision.is_error());
        assert!(decision.clarify_needed);
        assert_eq!(
            decision.status,
            DecisionStatus::Error("gemini_quota_exceeded".to_string())
        );
    }
}
