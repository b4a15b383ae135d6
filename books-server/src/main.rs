use std::sync::Arc;

use anyhow::Context;
use books_server::AppState;
use books_server::ServerConfig;
use books_server::demo;
use books_server::router;
use books_server::worker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    let state = Arc::new(AppState::new(config.clone()));

    if config.seed_demo
        && let Err(err) = demo::seed_demo_data(state.as_ref())
    {
        tracing::warn!(error = %err, "demo seed skipped");
    }

    tokio::spawn(worker::run_story_worker(state.clone()));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "books server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server terminated")
}
