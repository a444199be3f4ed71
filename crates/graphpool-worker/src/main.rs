//! graphpool-worker — background worker with per-context graph connection pools.
//!
//! Starts one work context per worker thread, each driving its own
//! single-threaded runtime, and runs synthetic graph jobs through the
//! process-wide pool registry:
//! - Configuration (environment, optionally layered over a TOML file)
//! - Pool registry + periodic sweeper
//! - Worker threads, one context each
//! - JSON report of per-context pool statistics
//!
//! # Usage
//!
//! ```text
//! GRAPHPOOL_URI=memory://graph GRAPHPOOL_USERNAME=worker GRAPHPOOL_PASSWORD=secret \
//!     graphpool-worker run --contexts 4 --jobs 200 --namespace docs --namespace chunks
//! graphpool-worker config --config /etc/graphpool.toml
//! ```

mod worker;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use graphpool::ConnectionConfig;
use tracing::info;

use crate::worker::RunOptions;

#[derive(Parser)]
#[command(name = "graphpool-worker", about = "Graph job worker with per-context connection pools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run synthetic jobs against the in-process graph driver.
    Run {
        /// TOML config file; environment variables override its values.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of work contexts (worker threads).
        #[arg(long, default_value = "2")]
        contexts: usize,

        /// Jobs per context.
        #[arg(long, default_value = "32")]
        jobs: usize,

        /// Concurrent jobs per context.
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Namespace to prepare; repeat for several. Jobs rotate through them.
        #[arg(long = "namespace", value_name = "NAME")]
        namespaces: Vec<String>,

        /// Simulated connect latency in milliseconds.
        #[arg(long, default_value = "0")]
        connect_latency_ms: u64,
    },
    /// Print the resolved configuration with the password redacted.
    Config {
        /// TOML config file; environment variables override its values.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,graphpool=debug,graphpool_worker=debug")
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            contexts,
            jobs,
            concurrency,
            namespaces,
            connect_latency_ms,
        } => {
            let config = ConnectionConfig::load(config.as_deref())?;
            let options = RunOptions {
                contexts,
                jobs,
                concurrency,
                namespaces: if namespaces.is_empty() {
                    vec!["default".to_string()]
                } else {
                    namespaces
                },
                connect_latency: Duration::from_millis(connect_latency_ms),
            };
            info!(contexts, jobs, concurrency, "graph worker starting");
            let report = worker::run(config, options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!("graph worker stopped");
            Ok(())
        }
        Command::Config { config } => {
            let config = ConnectionConfig::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}
