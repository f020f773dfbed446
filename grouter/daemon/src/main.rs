//! grouter Daemon
//!
//! Routes memcached clients (or a synthetic workload) to a pluggable target.
//!
//! # Usage
//!
//! ```bash
//! # memcached ascii on port 11300, in-memory store
//! grouter
//!
//! # Forward to a real memcached over the binary protocol
//! grouter --target memcached-binary:127.0.0.1:11211
//!
//! # Load-test a memcached with 8 workload workers
//! grouter --source workload --source-max-conns 8 --target memcached-ascii:127.0.0.1:11211
//!
//! # With config file and verbose logging
//! RUST_LOG=debug grouter --config /etc/grouter.toml
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop accepting, let targets finish, exit

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use grouter_core::{load_config, ConfigOverrides, Dispatcher, Registry};

/// grouter - protocol-agnostic request router
#[derive(Parser, Debug)]
#[command(name = "grouter")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Source of requests, KIND[:PARAMS]: memcached-ascii:HOST:PORT or workload
    #[arg(long, env = "GROUTER_SOURCE", value_name = "SPEC")]
    source: Option<String>,

    /// Max concurrently active source connections (workload: worker count)
    #[arg(long, env = "GROUTER_SOURCE_MAX_CONNS", value_name = "N")]
    source_max_conns: Option<usize>,

    /// Target of requests, KIND[:PARAMS]: memory, memcached-ascii:HOST:PORT,
    /// memcached-binary:HOST:PORT (alias memcached:HOST:PORT)
    #[arg(long, env = "GROUTER_TARGET", value_name = "SPEC")]
    target: Option<String>,

    /// Routing queue capacity in batches
    #[arg(long, env = "GROUTER_TARGET_CHAN_SIZE", value_name = "N")]
    target_chan_size: Option<usize>,

    /// Number of target workers draining the routing queue
    #[arg(long, env = "GROUTER_TARGET_WORKERS", value_name = "N")]
    target_workers: Option<usize>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "GROUTER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source: self.source.clone(),
            source_max_conns: self.source_max_conns,
            target: self.target.clone(),
            target_queue_capacity: self.target_chan_size,
            target_workers: self.target_workers,
        }
    }
}

/// Cancel `token` on the first Ctrl+C or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grouter=info".parse()?)
                .add_directive("grouter_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref(), args.overrides())
        .context("Failed to load configuration")?;

    let dispatcher = Dispatcher::new(config, &Registry::builtin())
        .context("Invalid source or target specification")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    dispatcher
        .run(shutdown)
        .await
        .context("Router stopped with an error")?;

    info!("grouter exited cleanly");
    Ok(())
}
