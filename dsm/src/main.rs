//! # DSM Binary
//!
//! Coordinator front end and worker entry point in one executable.
//!
//! # Usage
//!
//! ```bash
//! # Broadcast to four workers
//! dsm broadcast --message "Hello" --workers 4
//!
//! # With a config file and verbose JSON logs
//! dsm --config /etc/dsm/dsm.toml -v --json broadcast -m "Hello" -w 4
//! ```
//!
//! The `worker` subcommand is invoked by the coordinator's supervisor and is
//! hidden from help.

use clap::{Parser, Subcommand};
use dsm::{Coordinator, CoordinatorError, ProcessSupervisor, worker_main};
use dsm_common::config::{DsmConfig, LogLevel};
use dsm_common::consts::DEFAULT_CONFIG_PATH;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// DSM - broadcast a message to worker processes over dynamic shared memory
#[derive(Parser, Debug)]
#[command(name = "dsm")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Broadcast a message to worker processes over dynamic shared memory")]
#[command(long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch workers and send each of them the same message
    Broadcast {
        /// Message to send
        #[arg(short, long)]
        message: String,

        /// Number of workers to launch
        #[arg(short, long)]
        workers: usize,
    },

    /// Worker entry point
    #[command(hide = true)]
    Worker {
        /// Numeric handle of the shared region
        #[arg(long)]
        region_handle: u32,

        /// Hex-encoded side-channel carrying the worker index
        #[arg(long)]
        extra: String,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            error!("dsm failed: {}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32, Box<dyn std::error::Error>> {
    let args = Args::parse();

    match &args.command {
        Command::Worker {
            region_handle,
            extra,
        } => {
            setup_tracing(&args, LogLevel::Info);
            Ok(worker_main(*region_handle, extra))
        }
        Command::Broadcast { message, workers } => {
            let config = match load_config(args.config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    setup_tracing(&args, LogLevel::Info);
                    return Err(e);
                }
            };
            setup_tracing(&args, config.shared.log_level);
            info!(
                "{} v{} starting",
                config.shared.service_name,
                env!("CARGO_PKG_VERSION")
            );

            let supervisor = ProcessSupervisor::from_config(&config.coordinator)?;
            let mut coordinator = Coordinator::new(supervisor, config.coordinator);
            match coordinator.broadcast(message.as_bytes(), *workers) {
                Ok(report) => {
                    for record in &report.reports {
                        println!(
                            "worker {} (pid {}, attached {}): {}",
                            record.index,
                            record.pid,
                            record.attached_workers,
                            record.payload_text()
                        );
                    }
                    Ok(0)
                }
                Err(e) => {
                    report_failure(&e);
                    Ok(1)
                }
            }
        }
    }
}

/// Explicit path, else the default path if present, else built-in defaults.
fn load_config(path: Option<&Path>) -> Result<DsmConfig, Box<dyn std::error::Error>> {
    let default = Path::new(DEFAULT_CONFIG_PATH);
    let path = path.or_else(|| default.exists().then_some(default));
    Ok(DsmConfig::load_or_default(path)?)
}

fn report_failure(e: &CoordinatorError) {
    match e.hint() {
        Some(hint) => error!(hint, "broadcast failed: {e}"),
        None => error!(fatal = e.is_fatal_admin_shutdown(), "broadcast failed: {e}"),
    }
}

/// Setup tracing subscriber based on CLI arguments.
///
/// `RUST_LOG`, when set, replaces the configured level and `--verbose`.
fn setup_tracing(args: &Args, log_level: LogLevel) {
    let level = if args.verbose {
        LogLevel::Debug
    } else {
        log_level
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    // Stdout belongs to the worker protocol and the broadcast result
    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}
