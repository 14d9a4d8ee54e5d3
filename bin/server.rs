// ANS Consolidation - Query API server

use anyhow::{Context, Result};
use ans_consolidation::api::{router, AppState};
use ans_consolidation::logging::init_tracing;
use ans_consolidation::ServerConfig;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ServerConfig::from_env();
    if !config.db_path.exists() {
        warn!(
            path = %config.db_path.display(),
            "database not found; run `ans-pipeline run` first. /health will report unhealthy"
        );
    }

    let app = router(AppState::new(config.db_path.clone()));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, db = %config.db_path.display(), "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
