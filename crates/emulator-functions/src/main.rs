// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Functions emulator binary
//!
//! Serves the backends declared in `FUNCTIONS_EMULATOR_BACKENDS` until
//! interrupted.

use anyhow::Result;
use tracing::{error, info};

use emulator_functions::{Config, EmulatableBackend, FunctionsEmulatorBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    let config = Config::from_env().inspect_err(|e| eprintln!("Configuration error: {}", e))?;

    let default_level = if config.quiet {
        "emulator_functions=warn"
    } else {
        "emulator_functions=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    info!(
        project = %config.project_id,
        addr = %format!("{}:{}", config.host, config.port),
        mode = config.execution_mode().as_str(),
        max_workers_per_key = config.max_workers_per_key,
        "Configuration loaded"
    );

    let backends = EmulatableBackend::load_all(&config.backends_path).map_err(|e| {
        error!(path = %config.backends_path.display(), "Failed to load backends: {}", e);
        e
    })?;
    info!(count = backends.len(), "Backends loaded");

    let emulator = FunctionsEmulatorBuilder::from_config(&config)
        .backends(backends)
        .build()?;

    let addr = emulator.start().await?;
    info!("Functions emulator listening on http://{}", addr);

    if let Err(e) = emulator.connect().await {
        error!("Failed to load functions: {}", e);
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    emulator.stop().await?;
    info!("Shutdown complete");

    Ok(())
}
