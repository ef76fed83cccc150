//! Vigil host binary.
//!
//! Binds the configured listener, ingests agent telemetry into the log
//! sink, and keeps running until the listener itself fails.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use vigil_host::{load_config, IngestionServer, LogSink};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let config = load_config().await;
    let server = IngestionServer::new(config, Arc::new(LogSink));
    server.start().await.context("failed to start ingestion server")?;
    info!("vigil host ready");

    // The listener runs for the process lifetime; only a listener fault
    // brings it down.
    server.wait().await
}
