pub mod api; // HTTP + SSE surface
pub mod config;
pub mod core_state; // Composition root
pub mod db;
pub mod pipeline;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Anything that stops the service from coming up.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Core(#[from] core_state::CoreError),
    #[error(transparent)]
    Server(#[from] api::ServerError),
}

/// Run the service until Ctrl-C.
pub async fn run() -> Result<(), StartupError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = config::AppConfig::from_env()?;
    let bind_addr = config.bind_addr;
    let core = Arc::new(core_state::CoreState::from_config(config)?);
    core.start_sweeper()?;

    let mut server = api::start_api_server(core.clone(), bind_addr).await?;
    tracing::info!(addr = %server.session.server_addr, "Listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    server.shutdown();
    server.stopped().await;
    core.stop_sweeper()?;
    tracing::info!("{} stopped", config::APP_NAME);
    Ok(())
}
