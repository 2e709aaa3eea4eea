//! agentstream server binary.
//!
//! Reads configuration from the environment (see
//! [`agentstream::config::AppConfig::from_env`]), wires the stack, and
//! serves the chat API under the configured base path. Ctrl-C triggers a
//! graceful shutdown that cancels every in-flight stream.

use agentstream::abort::StreamAbortFabric;
use agentstream::config::AppConfig;
use agentstream::controller::{router, AppState};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    agentstream::init_logger();

    let config = AppConfig::from_env();
    let state = AppState::from_config(&config).await?;
    let fabric: Arc<StreamAbortFabric> = state.abort.clone();

    let app = axum::Router::new().nest(&config.server.base_path, router(state));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!(
        "agentstream listening on {}{}",
        addr,
        config.server.base_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutdown requested, cancelling active streams");
            fabric.shutdown().await;
        })
        .await?;
    Ok(())
}
