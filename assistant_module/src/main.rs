use tracing::info;

use assistant_module::service::{run_server, ServiceConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env()?;
    info!(
        "configuration loaded: provider={:?} state_root={} default_tz={}",
        config.llm_provider,
        config.state_root,
        config.default_tz.name()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };
    run_server(config, shutdown).await
}
