use std::env;
use std::time::Duration;

use chrono_tz::Tz;

use super::BoxError;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_TZ: &str = "Asia/Shanghai";
const DEFAULT_MAX_FETCH: u32 = 10;
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
// The first-run window is an explicit policy value, not a buried constant.
const DEFAULT_FIRST_RUN_LOOKBACK_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Gemini,
    DeepSeek,
}

/// Immutable process-lifetime configuration, collected once at startup
/// and passed by reference to every component.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub llm_provider: LlmProvider,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub deepseek_api_key: Option<String>,
    pub gmail_client_id: String,
    pub gmail_client_secret: String,
    pub gmail_refresh_token: String,
    /// The assistant's own address, excluded from recipients/attendees.
    pub my_email: String,
    /// Operator address for state-corruption and auth alerts.
    pub alert_email: String,
    /// State root: a local directory, or `az://container/prefix` for the
    /// remote backend.
    pub state_root: String,
    pub default_tz: Tz,
    pub max_fetch: u32,
    pub first_run_lookback: Duration,
    pub send_meeting_invite: bool,
    pub send_meeting_reply: bool,
    pub azure_connection_string: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let llm_provider = match env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "GEMINI".to_string())
            .trim()
            .to_uppercase()
            .as_str()
        {
            "DEEPSEEK" => LlmProvider::DeepSeek,
            _ => LlmProvider::Gemini,
        };
        let gemini_api_key = env_var_non_empty("GEMINI_API_KEY");
        let gemini_model =
            env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
        let deepseek_api_key = env_var_non_empty("DEEPSEEK_API_KEY");

        let gmail_client_id =
            env_var_non_empty("GMAIL_CLIENT_ID").ok_or("GMAIL_CLIENT_ID is not set")?;
        let gmail_client_secret =
            env_var_non_empty("GMAIL_CLIENT_SECRET").ok_or("GMAIL_CLIENT_SECRET is not set")?;
        let gmail_refresh_token =
            env_var_non_empty("GMAIL_REFRESH_TOKEN").ok_or("GMAIL_REFRESH_TOKEN is not set")?;
        let my_email = env_var_non_empty("GMAIL_SENDER")
            .ok_or("GMAIL_SENDER is not set")?
            .to_lowercase();
        let alert_email = env_var_non_empty("ALERT_EMAIL").unwrap_or_else(|| my_email.clone());

        let state_root =
            env::var("EMAIL_OUT_DIR").unwrap_or_else(|_| "./email_state".to_string());

        let default_tz_name = env::var("DEFAULT_TZ").unwrap_or_else(|_| DEFAULT_TZ.to_string());
        let default_tz: Tz = default_tz_name
            .parse()
            .map_err(|_| format!("invalid DEFAULT_TZ: {default_tz_name}"))?;

        let max_fetch = env::var("MAX_FETCH")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FETCH);
        let first_run_lookback = env::var("FIRST_RUN_LOOKBACK_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_FIRST_RUN_LOOKBACK_SECS));

        let send_meeting_invite = env_flag("SEND_MEETING_INVITE", false);
        let send_meeting_reply = env_flag("SEND_MEETING_REPLY", false);
        let azure_connection_string = env_var_non_empty("AZURE_STORAGE_CONNECTION_STRING");

        let config = Self {
            host,
            port,
            llm_provider,
            gemini_api_key,
            gemini_model,
            deepseek_api_key,
            gmail_client_id,
            gmail_client_secret,
            gmail_refresh_token,
            my_email,
            alert_email,
            state_root,
            default_tz,
            max_fetch,
            first_run_lookback,
            send_meeting_invite,
            send_meeting_reply,
            azure_connection_string,
        };
        Ok(config)
    }

    /// True when the selected reasoning provider has a credential.
    pub fn provider_key_present(&self) -> bool {
        match self.llm_provider {
            LlmProvider::Gemini => self.gemini_api_key.is_some(),
            LlmProvider::DeepSeek => self.deepseek_api_key.is_some(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            llm_provider: LlmProvider::Gemini,
            gemini_api_key: Some("test-key".to_string()),
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            deepseek_api_key: None,
            gmail_client_id: "cid".to_string(),
            gmail_client_secret: "secret".to_string(),
            gmail_refresh_token: "1//refresh".to_string(),
            my_email: "me@example.com".to_string(),
            alert_email: "ops@example.com".to_string(),
            state_root: "./email_state".to_string(),
            default_tz: DEFAULT_TZ.parse().expect("default tz"),
            max_fetch: DEFAULT_MAX_FETCH,
            first_run_lookback: Duration::from_secs(DEFAULT_FIRST_RUN_LOOKBACK_SECS),
            send_meeting_invite: false,
            send_meeting_reply: false,
            azure_connection_string: None,
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        ),
        Err(_) => default,
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
