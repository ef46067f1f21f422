use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::task;
use tracing::{error, info};

use analysis_module::llm::ReasoningService;
use analysis_module::resolver::ScheduleAnalyzer;
use analysis_module::{DeepSeekClient, GeminiClient};
use gmail_module::auth::GoogleAuth;
use gmail_module::client::GmailClient;

use crate::calendar::GoogleCalendar;
use crate::coordinator::{run_once, RunSummary};
use crate::filter::is_system_or_notification;
use crate::processor::MessageProcessor;
use crate::state_store::StateStore;

use super::config::{LlmProvider, ServiceConfig};
use super::BoxError;

#[derive(Clone)]
struct AppState {
    config: Arc<ServiceConfig>,
    store: Arc<StateStore>,
}

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    // backend selection happens here, once; runs only read the handle
    let store = Arc::new(StateStore::from_state_root(
        &config.state_root,
        config.azure_connection_string.as_deref(),
    )?);
    let config = Arc::new(config);
    let state = AppState {
        config: config.clone(),
        store,
    };

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("meeting assistant listening on {}", addr);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/gmail-webhook", post(gmail_webhook))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// The push trigger gets an empty success no matter what happened:
/// redelivery would only duplicate effort, and at-least-once handling is
/// the cursor/ledger's job. Failures are operator-visible in the logs
/// and alert mail only.
async fn gmail_webhook(State(state): State<AppState>) -> StatusCode {
    info!("webhook trigger received");
    if !state.config.provider_key_present() {
        error!("reasoning provider API key not set; skipping run");
        return StatusCode::NO_CONTENT;
    }

    let config = state.config.clone();
    let store = state.store.clone();
    let result = task::spawn_blocking(move || run_webhook(&config, &store)).await;
    match result {
        Ok(Ok(summary)) => info!("run complete: {:?}", summary),
        Ok(Err(err)) => error!("webhook processing failed: {}", err),
        Err(err) => error!("webhook task panicked: {}", err),
    }
    StatusCode::NO_CONTENT
}

fn run_webhook(config: &ServiceConfig, store: &StateStore) -> Result<RunSummary, BoxError> {
    let auth = GoogleAuth::new(
        config.gmail_client_id.clone(),
        config.gmail_client_secret.clone(),
        config.gmail_refresh_token.clone(),
    );
    let mail = GmailClient::new(auth.clone(), config.my_email.clone(), config.max_fetch);
    let calendar = GoogleCalendar::new(auth);

    let llm: Box<dyn ReasoningService> = match config.llm_provider {
        LlmProvider::Gemini => Box::new(GeminiClient::new(
            config.gemini_api_key.clone().unwrap_or_default(),
            config.gemini_model.clone(),
        )),
        LlmProvider::DeepSeek => Box::new(DeepSeekClient::new(
            config.deepseek_api_key.clone().unwrap_or_default(),
        )),
    };
    let analyzer = ScheduleAnalyzer::new(llm);
    let processor = MessageProcessor::new(
        &analyzer,
        &calendar,
        &mail,
        config.my_email.clone(),
        config.default_tz,
        config.send_meeting_invite,
        config.send_meeting_reply,
    );

    let summary = run_once(config, store, &mail, &processor, &|msg, me| {
        is_system_or_notification(msg, me)
    })?;
    Ok(summary)
}
