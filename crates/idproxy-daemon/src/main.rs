//! idproxy
//!
//! Forwards every request to the destination named by its path, authenticated
//! with an identity token minted for that destination.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::net::TcpListener;
use tracing::{error, info};

use idproxy::{Forwarder, shutdown};
use idproxy_daemon::config::ProxyConfig;
use idproxy_daemon::error::Result;
use idproxy_daemon::server;

/// Identity-token forwarding proxy.
#[derive(Debug, Parser)]
#[command(name = "idproxy", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "IDPROXY_CONFIG")]
    config: Option<PathBuf>,
}

/// Initializes structured logging with tracing.
///
/// Supports two output formats via `IDPROXY_LOG_FORMAT` environment variable:
/// - `json`: Machine-readable JSON logs
/// - `pretty`: Human-readable formatted logs (default)
///
/// Log level is controlled via `RUST_LOG` environment variable.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let format = std::env::var("IDPROXY_LOG_FORMAT")
        .unwrap_or_else(|_| "pretty".to_string())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("idproxy_daemon=info,idproxy=info"));

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("idproxy stopped: {e}");
            eprintln!("idproxy: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match ProxyConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return Err(e);
        }
    };

    let client = reqwest::Client::builder().build()?;
    let credentials = config.credentials.build_provider(client)?;
    info!(source = ?config.credentials.source, "Credential provider ready");

    let forwarder = Forwarder::new(credentials, config.forward_options());
    let (trigger, shutdown) = shutdown::channel();

    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    tokio::spawn(async move {
        use futures::stream::StreamExt;
        while let Some(signal) = signals.next().await {
            match signal {
                SIGTERM => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    trigger.trigger();
                    break;
                }
                SIGINT => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    trigger.trigger();
                    break;
                }
                _ => {}
            }
        }
    });

    let listener = TcpListener::bind(config.socket_addr()).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    let app = server::router(forwarder, shutdown.clone(), &config.health_path);
    server::run(listener, app, shutdown, config.shutdown_grace()).await?;

    info!("Shutdown complete");
    Ok(())
}
