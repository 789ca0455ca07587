//! reflectd - Reflection gateway daemon
//!
//! Serves one gRPC reflection endpoint that aggregates the reflection
//! services of every configured backend.
//!
//! Usage:
//!   reflectd [--config FILE] [--config-dir DIR] [--log-format text|json]
//!
//! Without `--config`, the file `reflection.toml` is read from the
//! directory given by `--config-dir` or `$CONFIG_PATH` (default `configs/`).
//! Exits with status 2 on any startup or server task failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use refcol_server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod registrar;
mod status;

use config::GatewayConfig;
use registrar::GatewayRegistrar;
use status::{GatewaySlot, StatusEndpoint};

/// Exit status for startup and server task failures
const FAILURE_EXIT_CODE: u8 = 2;

const DEFAULT_LOG_FILTER: &str =
    "reflectd=info,refcol_gateway=info,refcol_proxy=info,refcol_server=info";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "reflectd")]
#[command(about = "gRPC reflection gateway aggregating many backends", version)]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding reflection.toml when --config is not given
    #[arg(long, env = "CONFIG_PATH", default_value = "configs/")]
    config_dir: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "reflectd failed");
            ExitCode::from(FAILURE_EXIT_CODE)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    tracing::info!("Starting reflectd (reflection gateway)");

    let path = config::config_path(args.config.as_deref(), &args.config_dir);
    tracing::info!("Loading config from: {}", path.display());
    let config = GatewayConfig::load(&path).context("failed to load configuration")?;
    config.log();

    let slot = GatewaySlot::default();
    let mut server = Server::new(config.server_options());
    if let Some(http_addr) = &config.http_addr {
        let endpoint = StatusEndpoint::new(http_addr, &config.name, &config.services, slot.clone());
        server = server.with_auxiliary(Arc::new(endpoint));
    }

    let registrar = GatewayRegistrar::new(&config, slot);
    server
        .run(&config.addr, registrar)
        .await
        .context("server terminated with an error")?;

    tracing::info!("reflectd stopped");
    Ok(())
}
