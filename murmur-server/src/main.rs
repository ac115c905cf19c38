//! murmur-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the artifact store roots and the task registry.
//! 4. Spawn the transcription worker and the retention sweeper.
//! 5. Build the Axum router and serve until SIGTERM/Ctrl-C.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use murmur_core::{worker, ArtifactStore, TaskRegistry, TranscriberDriver, Worker};
use tracing::info;

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_level.parse().unwrap_or_default()),
        )
        .with_target(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "murmur-server starting");

    // ── 3. Store and registry ──────────────────────────────────────────────────
    let store = Arc::new(
        ArtifactStore::open(&cfg.upload_dir, &cfg.temp_dir, &cfg.result_dir).await?,
    );
    let registry = Arc::new(TaskRegistry::new(cfg.pool_capacity));
    info!(
        capacity = cfg.pool_capacity,
        uploads = %cfg.upload_dir,
        results = %cfg.result_dir,
        "artifact store ready"
    );

    // ── 4. Worker and sweeper ──────────────────────────────────────────────────
    let driver = TranscriberDriver::new(cfg.whisper_bin.clone());
    tokio::spawn(
        Worker::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            driver,
            cfg.retention(),
        )
        .run(),
    );
    tokio::spawn(worker::run_sweeper(
        Arc::clone(&registry),
        Arc::clone(&store),
        cfg.retention(),
    ));

    // ── 5. HTTP server ─────────────────────────────────────────────────────────
    let state = AppState {
        config: Arc::new(cfg.clone()),
        registry,
        store,
    };
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("murmur-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
