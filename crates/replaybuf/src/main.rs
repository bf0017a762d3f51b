use anyhow::{Context, Result};
use clap::Parser;
use replaybuf::RuntimeConfig;
use std::path::PathBuf;

/// Prioritized experience-replay server
#[derive(Parser)]
#[command(name = "replaybuf")]
#[command(version)]
#[command(about = "Prioritized experience-replay server", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen port (overrides config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Host a single table with this name (overrides config file tables)
    #[arg(short, long, value_name = "NAME")]
    table: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load_or_default().context("Failed to load configuration")?
    };

    apply_cli_overrides(&mut config, &cli);

    replaybuf::init_tracing(&config);

    replaybuf::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.listen_addr = format!("0.0.0.0:{}", port);
    }

    if let Some(name) = &cli.table {
        config.tables = vec![replaybuf::config::TableConfig {
            name: name.clone(),
            max_size: 1_000_000,
            min_size_to_sample: 1,
            default_flexible_batch_size: 64,
        }];
    }

    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
}
