// replaybuf server - hosts priority tables behind the frame transport
//
// Features:
// - Streaming ingest and prioritized sampling via replaybuf-service
// - TOML configuration with CLI overrides
// - Structured logging with tracing
// - Graceful shutdown

use anyhow::{Context, Result};
use replaybuf_core::{PriorityTable, PriorityTableOptions, Table};
use replaybuf_service::ReplayService;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

pub mod config;
pub mod net;

pub use config::RuntimeConfig;

/// Initialize tracing/logging from RuntimeConfig. Idempotent.
pub fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    let _ = match config.server.log_format {
        config::LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
        config::LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer()))
        }
    };
}

/// Build the hosted tables described by the configuration.
pub fn build_tables(config: &RuntimeConfig) -> Vec<Arc<dyn Table>> {
    config
        .tables
        .iter()
        .map(|table| {
            Arc::new(PriorityTable::new(
                table.name.clone(),
                PriorityTableOptions {
                    max_size: table.max_size,
                    min_size_to_sample: table.min_size_to_sample,
                    default_flexible_batch_size: table.default_flexible_batch_size,
                },
            )) as Arc<dyn Table>
        })
        .collect()
}

/// Run the server until Ctrl+C or SIGTERM.
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    config.validate()?;

    let tables = build_tables(&config);
    for table in &tables {
        info!("Hosting table: {}", table.debug_string());
    }

    let service = ReplayService::create(tables, None)
        .await
        .map_err(|status| anyhow::anyhow!("Failed to create service: {}", status))?;

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen_addr))?;

    info!(
        "Replay server listening on {}",
        listener.local_addr().context("Failed to read local addr")?
    );
    info!("Press Ctrl+C or send SIGTERM to stop");

    net::serve(service, listener, shutdown_signal()).await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
