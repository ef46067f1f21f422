//! End-to-end thread analysis: normalize, prompt, call the model, repair
//! the output, post-validate the returned time.

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, info};

use crate::decision::{Confidence, Decision, DecisionStatus};
use crate::llm::ReasoningService;
use crate::normalize::normalize;
use crate::prompt::build_schedule_prompt;
use crate::repair::parse_llm_json;

const MAX_OUTPUT_TOKENS: u32 = 4096;

pub struct ScheduleAnalyzer {
    llm: Box<dyn ReasoningService>,
}

impl ScheduleAnalyzer {
    pub fn new(llm: Box<dyn ReasoningService>) -> Self {
        Self { llm }
    }

    /// Analyze a thread body against a `YYYY/MM/DD` baseline date.
    ///
    /// Transport and parse failures come back as `status == Error`
    /// decisions; they are never retried here. Retrying a message is the
    /// run coordinator's job via the failed-ID ledger.
    pub fn analyze(&self, email_body: &str, baseline_date: &str) -> Decision {
        let processed = normalize(email_body);
        debug!("normalized thread body ({} chars)", processed.len());

        let prompt = build_schedule_prompt(&processed, baseline_date);
        let content = match self.llm.complete(&prompt, MAX_OUTPUT_TOKENS) {
            Ok(content) => content,
            Err(err) => {
                info!("reasoning service call failed: {}", err);
                return Decision::error(err.to_string(), "LLM call failed");
            }
        };

        let value = match parse_llm_json(&content) {
            Some(value) => value,
            None => {
                info!("reasoning service output was not parsable JSON");
                return Decision::error("llm_output_unparsable", "JSON parse failed");
            }
        };

        let mut decision = Decision::from_value(&value);
        post_validate(&mut decision, baseline_date);
        decision.status = DecisionStatus::Ok;
        decision
    }
}

/// Enforce the mechanically checkable part of the contract: a returned
/// `meeting_time` must be well-formed and not earlier than the baseline
/// date. The model's own flags are not trusted for this.
pub fn post_validate(decision: &mut Decision, baseline_date: &str) {
    if decision.meeting_time.is_empty() {
        return;
    }

    let meeting = NaiveDateTime::parse_from_str(&decision.meeting_time, "%Y-%m-%d %H:%M");
    let baseline = NaiveDate::parse_from_str(baseline_date, "%Y/%m/%d");

    match (meeting, baseline) {
        (Ok(meeting), Ok(baseline)) => {
            let Some(floor) = baseline.and_hms_opt(0, 0, 0) else {
                return;
            };
            if meeting < floor {
                decision.clarify_needed = true;
                decision.clarify_reason = format!(
                    "The proposed meeting time ({}) is earlier than the reference date ({}).",
                    decision.meeting_time, baseline_date
                );
                decision.confidence = Confidence::Low;
            }
        }
        (Err(err), _) => {
            decision.clarify_needed = true;
            if decision.clarify_reason.is_empty() {
                decision.clarify_reason = format!("Time validation error: {err}");
            }
        }
        (_, Err(err)) => {
            decision.clarify_needed = true;
            if decision.clarify_reason.is_empty() {
                decision.clarify_reason = format!("Time validation error: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::sync::Mutex;

    struct StubModel {
        responses: Mutex<Vec<Result<String, LlmError>>>,
    }

    impl StubModel {
        fn returning(response: Result<String, LlmError>) -> Box<Self> {
            Box::new(Self {
                responses: Mutex::new(vec![response]),
            })
        }
    }

    impl ReasoningService for StubModel {
        fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
            self.responses
                .lock()
                .expect("stub lock")
                .pop()
                .unwrap_or_else(|| Ok("{}".to_string()))
        }
    }

    const CONFIRMED: &str = r#"{
        "meeting_intent": true,
        "meeting_subject": "Sync",
        "meeting_time": "2025-11-07 14:00",
        "attendees": ["a@example.com", "b@example.com"],
        "confidence": "high",
        "clarify_needed": false,
        "clarify_reason": "",
        "reasoning": "cross-participant acceptance"
    }"#;

    #[test]
    fn confirmed_future_time_passes_through() {
        let analyzer = ScheduleAnalyzer::new(StubModel::returning(Ok(CONFIRMED.to_string())));
        let decision = analyzer.analyze("A: 2pm 11/7? B: ok", "2025/11/05");
        assert_eq!(decision.status, DecisionStatus::Ok);
        assert_eq!(decision.meeting_time, "2025-11-07 14:00");
        assert!(!decision.clarify_needed);
        assert_eq!(decision.confidence, Confidence::High);
    }

    #[test]
    fn fenced_output_parses_like_bare_json() {
        let fenced = format!("```json\n{}\n```", CONFIRMED);
        let analyzer = ScheduleAnalyzer::new(StubModel::returning(Ok(fenced)));
        let decision = analyzer.analyze("thread", "2025/11/05");
        assert_eq!(decision.meeting_time, "2025-11-07 14:00");
        assert!(!decision.clarify_needed);
    }

    #[test]
    fn past_time_is_forced_to_clarify() {
        let past = CONFIRMED.replace("2025-11-07 14:00", "2025-11-01 14:00");
        let analyzer = ScheduleAnalyzer::new(StubModel::returning(Ok(past)));
        let decision = analyzer.analyze("thread", "2025/11/05");
        assert_eq!(decision.status, DecisionStatus::Ok);
        assert!(decision.clarify_needed);
        assert_eq!(decision.confidence, Confidence::Low);
        assert!(decision.clarify_reason.contains("earlier than the reference date"));
    }

    #[test]
    fn malformed_time_is_forced_to_clarify() {
        let bad = CONFIRMED.replace("2025-11-07 14:00", "sometime next week");
        let analyzer = ScheduleAnalyzer::new(StubModel::returning(Ok(bad)));
        let decision = analyzer.analyze("thread", "2025/11/05");
        assert!(decision.clarify_needed);
        assert!(decision.clarify_reason.contains("Time validation error"));
    }

    #[test]
    fn transport_failure_yields_error_status() {
        let analyzer = ScheduleAnalyzer::new(StubModel::returning(Err(
            LlmError::QuotaExceeded { provider: "gemini" },
        )));
        let decision = analyzer.analyze("thread", "2025/11/05");
        assert_eq!(
            decision.status,
            DecisionStatus::Error("gemini_quota_exceeded".to_string())
        );
        assert!(decision.clarify_needed);
    }

    #[test]
    fn unparsable_output_yields_error_status() {
        let analyzer =
            ScheduleAnalyzer::new(StubModel::returning(Ok("not json at all".to_string())));
        let decision = analyzer.analyze("thread", "2025/11/05");
        assert_eq!(
            decision.status,
            DecisionStatus::Error("llm_output_unparsable".to_string())
        );
    }
}
