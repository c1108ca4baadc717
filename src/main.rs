#![forbid(unsafe_code)]

//! `prochive`: runs the supervisor described by a TOML file.
//!
//! The same binary serves as master and, when re-executed with a role
//! marker, as each of its children.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use prochive::{AppError, Result, Server, ServerConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "prochive", about = "Multi-process supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Detach from the terminal and run in the background.
    #[arg(long)]
    daemon: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!(%err, "prochive failed");
            std::process::exit(1);
        }
    }
}

fn run(args: Cli) -> Result<i32> {
    let config = match &args.config {
        Some(path) => ServerConfig::load_from_path(path)?,
        None => ServerConfig::default(),
    };
    if config.workers.is_empty() && config.periodic.is_empty() {
        info!("no workers or periodic tasks configured");
    }
    Server::from_config(config)?.run(args.daemon)
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
