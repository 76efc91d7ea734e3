//! HTTP server for agent execution jobs.
//!
//! Run with: cargo run -p agent-jobs-server -- --agents-dir .
//!
//! Then submit a job:
//!
//! ```text
//! curl -X POST localhost:3000/agents/execute \
//!   -H 'content-type: application/json' \
//!   -d '{"configPath": "agents/echo.yaml", "task": "hello"}'
//! ```

mod config;

use std::sync::Arc;

use agent_jobs_engine::AgentRunner;
use agent_jobs_session::{ExecutionOrchestrator, storage::MemoryStore};
use agent_jobs_transport::{ApiState, build_router, routes::health};
use axum::{Router, routing::get};
use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::parse();
    let addr = config.addr()?;
    anyhow::ensure!(config.default_ttl > 0, "--default-ttl must be greater than zero");

    let store = Arc::new(MemoryStore::new());
    let sweeper = Arc::clone(&store).spawn_sweeper(config.sweep_interval());
    let engine = Arc::new(AgentRunner::new(config.agents_dir.clone()));
    let orchestrator =
        Arc::new(ExecutionOrchestrator::new(store, engine).with_default_ttl(config.default_ttl()));
    let state = ApiState::new(Arc::clone(&orchestrator));

    let app = Router::new()
        .route("/health", get(health::<MemoryStore, AgentRunner>))
        .with_state(state.clone())
        .nest("/agents", build_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        agents_dir = %config.agents_dir.display(),
        "Server listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let interrupted = orchestrator.shutdown(config.shutdown_grace()).await;
    if interrupted > 0 {
        tracing::warn!("Interrupted {interrupted} executions on shutdown");
    }
    sweeper.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
