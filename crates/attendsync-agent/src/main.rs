// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! attendsync agent - offline-first attendance sync for kiosks
//!
//! Runs on each kiosk:
//! - Drains the local outbox to the backend when it is reachable
//! - Probes backend connectivity
//! - Cleans up old photos and logs
//! - Shuts down in order on SIGTERM/SIGINT

use tracing::{info, warn};

use attendsync_agent::config::Config;
use attendsync_agent::runtime::AgentRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "attendsync_agent=info,attendsync_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        backend_url = %config.backend_url,
        device_id = %config.device_id,
        database = %config.database_path.display(),
        sync_enabled = config.sync_enabled,
        "Starting attendsync agent"
    );

    let runtime = AgentRuntime::builder()
        .with_config(&config)?
        .build()?
        .start()
        .await?;

    let status = runtime.status().await?;
    info!(status = %serde_json::to_string(&status)?, "Agent ready");

    // Signal listener drives the shutdown; wait for it to finish
    runtime.wait().await;

    info!("attendsync agent shut down");

    Ok(())
}
