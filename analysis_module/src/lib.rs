pub mod decision;
pub mod llm;
pub mod normalize;
pub mod prompt;
pub mod repair;
pub mod resolver;
pub mod time;

pub use decision::{Confidence, Decision, DecisionStatus};
pub use llm::{DeepSeekClient, GeminiClient, LlmError, ReasoningService};
pub use normalize::normalize;
pub use resolver::ScheduleAnalyzer;
pub use time::{parse_human_time, sender_timezone};
