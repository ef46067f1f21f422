//! Reasoning-service transports.
//!
//! Both providers are plain HTTP. No retry happens here: a failed call is
//! reported upward and the run coordinator's failed-ID ledger decides
//! whether the message is attempted again on a later run.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEEPSEEK_API_URL: &str = "https://api.deepseek.com/v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const DEEPSEEK_SYSTEM_PROMPT: &str = "As a meeting assistant, your task is to: analyze the \
email for scheduling intent, identify potential dates/times, and validate their accuracy.";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider}_model_not_found: {model}")]
    ModelNotFound {
        provider: &'static str,
        model: String,
    },
    #[error("{provider}_permission_denied (invalid API key or service not enabled)")]
    PermissionDenied { provider: &'static str },
    #[error("{provider}_quota_exceeded")]
    QuotaExceeded { provider: &'static str },
    #[error("{provider} returned empty output")]
    EmptyOutput { provider: &'static str },
    #[error("{provider}_call_failed: {reason}")]
    CallFailed {
        provider: &'static str,
        reason: String,
    },
}

/// Deterministic, JSON-biased completion endpoint.
pub trait ReasoningService: Send + Sync {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError>;
}

pub struct GeminiClient {
    http: reqwest::blocking::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, model, GEMINI_API_BASE)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: blocking_client(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        }
    }
}

impl ReasoningService for GeminiClient {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.0,
                "topP": 0.9,
                "maxOutputTokens": max_tokens,
                "responseMimeType": "application/json",
            },
        });

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .map_err(|err| LlmError::CallFailed {
                provider: "gemini",
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status_error(
                "gemini",
                status.as_u16(),
                &self.model,
                response.text().unwrap_or_default(),
            ));
        }

        let payload: Value = response.json().map_err(|err| LlmError::CallFailed {
            provider: "gemini",
            reason: err.to_string(),
        })?;
        let text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string();
        if text.is_empty() {
            debug!("gemini raw payload: {payload}");
            return Err(LlmError::EmptyOutput { provider: "gemini" });
        }
        Ok(text)
    }
}

pub struct DeepSeekClient {
    http: reqwest::blocking::Client,
    api_key: String,
    endpoint: String,
}

impl DeepSeekClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, DEEPSEEK_API_URL)
    }

    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            http: blocking_client(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl ReasoningService for DeepSeekClient {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let body = json!({
            "model": "deepseek-chat",
            "messages": [
                {"role": "system", "content": DEEPSEEK_SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": 0.0,
            "max_tokens": max_tokens,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|err| LlmError::CallFailed {
                provider: "deepseek",
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status_error(
                "deepseek",
                status.as_u16(),
                "deepseek-chat",
                response.text().unwrap_or_default(),
            ));
        }

        let payload: Value = response.json().map_err(|err| LlmError::CallFailed {
            provider: "deepseek",
            reason: err.to_string(),
        })?;
        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(LlmError::EmptyOutput {
                provider: "deepseek",
            });
        }
        Ok(text)
    }
}

fn blocking_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::blocking::Client::new())
}

fn map_status_error(provider: &'static str, status: u16, model: &str, body: String) -> LlmError {
    match status {
        404 => LlmError::ModelNotFound {
            provider,
            model: model.to_string(),
        },
        401 | 403 => LlmError::PermissionDenied { provider },
        429 => LlmError::QuotaExceeded { provider },
        _ => LlmError::CallFailed {
            provider,
            reason: format!("HTTP {status}: {body}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_parses_candidate_text() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/models/gemini-2.5-flash:generateContent")
            .match_query(mockito::Matcher::UrlEncoded("key".into(), "k".into()))
            .with_status(200)
            .with_body(
                r#"{"candidates":[{"content":{"parts":[{"text":"{\"meeting_intent\":true}"}]}}]}"#,
            )
            .create();

        let client = GeminiClient::with_base_url("k", "gemini-2.5-flash", server.url());
        let text = client.complete("prompt", 256).expect("complete");
        assert_eq!(text, r#"{"meeting_intent":true}"#);
        mock.assert();
    }

    #[test]
    fn gemini_maps_quota_and_permission_statuses() {
        let mut server = mockito::Server::new();
        let _quota = server
            .mock("POST", "/models/m:generateContent")
            .match_query(mockito::Matcher::Any)
            .with_status(429)
            .create();
        let client = GeminiClient::with_base_url("k", "m", server.url());
        let err = client.complete("p", 16).expect_err("quota");
        assert_eq!(err.to_string(), "gemini_quota_exceeded");
    }

    #[test]
    fn gemini_empty_candidates_is_an_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/models/m:generateContent")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"candidates":[]}"#)
            .create();
        let client = GeminiClient::with_base_url("k", "m", server.url());
        let err = client.complete("p", 16).expect_err("empty");
        assert!(matches!(err, LlmError::EmptyOutput { .. }));
    }

    #[test]
    fn deepseek_parses_chat_completion() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"{}"}}]}"#)
            .create();
        let client = DeepSeekClient::with_endpoint(
            "k",
            format!("{}/v1/chat/completions", server.url()),
        );
        let text = client.complete("p", 16).expect("complete");
        assert_eq!(text, "{}");
    }

    #[test]
    fn deepseek_model_not_found_carries_model_name() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(404)
            .create();
        let client = DeepSeekClient::with_endpoint(
            "k",
            format!("{}/v1/chat/completions", server.url()),
        );
        let err = client.complete("p", 16).expect_err("not found");
        assert_eq!(err.to_string(), "deepseek_model_not_found: deepseek-chat");
    }
}
