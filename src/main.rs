//! Disaster Feed Service — Binary Entrypoint
//! Boots the Axum HTTP server, wiring the read API, metrics, and the
//! file-backed ingestion pipeline.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bousai_feed::api;
use bousai_feed::config::Config;
use bousai_feed::metrics::Metrics;
use bousai_feed::service::FeedService;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bousai_feed=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let metrics = Metrics::init();
    let config = Config::load();
    let addr = std::env::var("BOUSAI_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

    let service = FeedService::from_config(config);
    let app = api::create_router(service).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "bousai-feed listening");
    axum::serve(listener, app).await?;
    Ok(())
}
