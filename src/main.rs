//! hsmwire - HSM host protocol client
//!
//! Connects to an HSM, runs a diagnostics probe and reports the result.

use hsmwire_client::{Client, Config};
use hsmwire_deadline::DeadlineCoordinator;
use hsmwire_protocol::CommandTable;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if HSMWIRE_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    // A broken catalog is fatal before any connection is attempted
    let table = match CommandTable::from_file(&config.catalog.path) {
        Ok(table) => Arc::new(table),
        Err(e) => {
            tracing::error!("Failed to load command catalog: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting hsmwire");
    tracing::info!("  HSM address: {}", config.network.addr);
    tracing::info!(
        "  Catalog: {} ({} commands)",
        config.catalog.path.display(),
        table.command_names().len()
    );
    tracing::info!("  Trace width: {}", config.protocol.trace_width);
    match config.network.request_timeout() {
        Some(timeout) => tracing::info!("  Request timeout: {:?}", timeout),
        None => tracing::info!("  Request timeout: unbounded"),
    }

    let coordinator = DeadlineCoordinator::new(config.deadline.clone());
    let client = Client::from_config(&config, table, coordinator.clone())?;
    client.connect().await?;

    let conn = client.connection();
    let read_handle = tokio::spawn(async move {
        if let Err(e) = conn.read_loop().await {
            tracing::debug!("Read loop ended: {}", e);
        }
    });

    let probe = client.diagnostics().await;
    match &probe {
        Ok(result) => tracing::info!(
            "HSM diagnostics: lmk_check={} firmware={}",
            result.lmk_check,
            result.firmware
        ),
        Err(e) => tracing::error!("HSM diagnostics failed: {}", e),
    }

    client.close().await?;
    read_handle.abort();
    coordinator.shutdown();

    probe?;
    tracing::info!("Client stopped");
    Ok(())
}
