// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus control plane server.
//!
//! Connects the database (running migrations), starts the runner monitor
//! and waits for Ctrl-C.

use tracing::{info, warn};

use stratus_core::persistence;
use stratus_server::config::Config;
use stratus_server::runtime::{ControlPlaneRuntime, ControlPlaneRuntimeBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_server=info,stratus_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        webhook_base_url = config.webhook_base_url.as_deref().unwrap_or("-"),
        monitor_interval_secs = config.runner_monitor_interval.as_secs(),
        "Starting Stratus control plane"
    );

    let persistence = persistence::connect(&config.database_url, config.db_max_connections).await?;
    info!("Connected to database");

    // Provider clients are registered by the embedding front end; the
    // standalone process serves runners and state versions only.
    let runtime: ControlPlaneRuntime = ControlPlaneRuntimeBuilder::from_config(&config)
        .persistence(persistence)
        .build()?
        .start()
        .await?;

    info!("Stratus control plane ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Stratus control plane shut down");

    Ok(())
}
