// Main entrypoint for the vhostlb load balancer.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vhostlb::balancer::Balancer;
use vhostlb::config::{self, StartupConfig};
use vhostlb::shutdown::GracefulShutdown;
use vhostlb::time;

/// vhostlb - host-routed HTTP reverse proxy / load balancer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Custom config file path.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run with verbose (debug) logging regardless of the config file.
    #[arg(long)]
    debug: bool,
}

fn configure_logger(cfg: &StartupConfig, debug: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if debug { "debug" } else { cfg.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if cfg.is_prod() {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let shutdown_token = CancellationToken::new();

    let _time_token = time::start(Duration::from_millis(500));

    let cfg = config::load(args.config.as_deref())?;
    configure_logger(&cfg, args.debug);

    info!(
        component = "main",
        event = "starting",
        env = %cfg.env,
        external_listeners = ?cfg.external_listeners,
        internal_listeners = ?cfg.internal_listeners,
        management_listeners = ?cfg.management_listeners,
        "vhostlb starting"
    );

    let graceful_shutdown = GracefulShutdown::new(shutdown_token.clone());
    graceful_shutdown
        .set_graceful_timeout(Duration::from_secs(30))
        .await;

    let balancer = Balancer::new(cfg, shutdown_token.clone())
        .context("failed to initialize balancer")?;

    if let Err(e) = balancer.serve(&graceful_shutdown).await {
        error!(
            component = "main",
            event = "serve_failed",
            error = %e,
            "failed to start listeners"
        );
        return Err(e);
    }

    if let Err(e) = graceful_shutdown.await_shutdown().await {
        error!(
            component = "main",
            event = "graceful_shutdown_failed",
            error = %e,
            "failed to gracefully shut down"
        );
        return Err(e);
    }

    Ok(())
}
