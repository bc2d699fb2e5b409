//! ntquery-bridge: companion process for bridge-mediated backends
//!
//! Serves health, query dispatch and SSE job streams on localhost.
//! Run with: OPENROUTER_API_KEY=... cargo run --bin ntquery-bridge

use anyhow::Context;
use std::{env, sync::Arc};
use tracing_subscriber::EnvFilter;

use ntquery::bridge::{self, BridgeState};
use ntquery::config::Config;
use ntquery::docs;
use ntquery::openrouter::OpenRouter;
use ntquery::planner::Planner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("NTQUERY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::load()?;

    // Configuration from environment
    let port: u16 = env::var("NTQUERY_BRIDGE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8787);
    let host = env::var("NTQUERY_BRIDGE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let secure_port: Option<u16> = env::var("NTQUERY_BRIDGE_SECURE_PORT")
        .ok()
        .and_then(|p| p.parse().ok());

    let client = reqwest::Client::new();
    let docs = docs::load(cfg.docs_source.as_deref(), &client).await;
    let openrouter = cfg
        .openrouter_api_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .map(|key| OpenRouter::new(client.clone(), key));
    if openrouter.is_none() {
        tracing::info!("no OpenRouter key configured; only the direct backend is offered");
    }

    let state = Arc::new(BridgeState::new(
        Planner::new(docs, cfg.doc_limit),
        openrouter,
        secure_port,
    ));
    let app = bridge::router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "ntquery-bridge listening");

    axum::serve(listener, app).await?;
    Ok(())
}
