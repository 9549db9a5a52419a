use std::time::Duration;

use compute_orchestrator::api::build_router;
use compute_orchestrator::config::Config;
use compute_orchestrator::scheduler::spawn_ticker;
use compute_orchestrator::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    if config.jwt_secret == "dev-secret-change-me" {
        tracing::warn!("JWT_SECRET not set; using an insecure development default");
    }

    let port = config.port;
    let state = AppState::new(config);
    state
        .workspaces
        .load()
        .await
        .map_err(|e| anyhow::anyhow!("failed to load workspace snapshot: {e}"))?;

    spawn_ticker(
        state.scheduler.clone(),
        state.registry.clone(),
        Duration::from_millis(state.config.dispatch_tick_ms),
        Duration::from_secs(state.config.eviction_tick_seconds),
        Duration::from_secs(state.config.gc_tick_seconds),
        state.config.job_retention_hours,
    );

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, ws_path = %state.config.ws_path, "orchestrator listening");

    let router = build_router(state);
    axum::serve(listener, router).await?;
    Ok(())
}
