#![forbid(unsafe_code)]

//! `prochive-ctl`: local control client for a running `prochive` master.
//!
//! Queries go over the FIFO relay; `stop` and `reload` signal the pid
//! recorded in the PID file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use prochive::master::paths::RunPaths;
use prochive::master::pidfile::running_master;
use prochive::relay::{
    ConnectionsQuery, QueryOutcome, RelayClient, RelayQuery, SchedulerQuery, StatusQuery,
};
use prochive::{AppError, Result, ServerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "prochive-ctl",
    about = "Control a running prochive master",
    version,
    long_about = None
)]
struct Cli {
    /// Path of the `prochive` executable the master was started from.
    #[arg(long)]
    entrypoint: Option<PathBuf>,

    /// The master's configuration file; supplies `pid_file` and the relay timeout.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Explicit PID file; overrides the configuration.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show server status.
    Status,
    /// List open connections.
    Connections,
    /// List periodic tasks.
    Scheduler,
    /// Stop the master gracefully.
    Stop,
    /// Reload reloadable workers.
    Reload,
}

fn main() {
    let args = Cli::parse();
    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Cli) -> Result<i32> {
    let config = match &args.config {
        Some(path) => ServerConfig::load_from_path(path)?,
        None => ServerConfig::default(),
    };
    let entrypoint = match &args.entrypoint {
        Some(path) => path.clone(),
        None => sibling_server_binary()?,
    };
    let pid_file = args.pid_file.as_deref().or(config.pid_file.as_deref());
    let paths = RunPaths::resolve(&entrypoint, pid_file);
    let client = RelayClient::new(paths.clone(), config.relay_timeout());

    match args.command {
        Command::Status => print_answer::<StatusQuery>(&client),
        Command::Connections => print_answer::<ConnectionsQuery>(&client),
        Command::Scheduler => print_answer::<SchedulerQuery>(&client),
        Command::Stop => signal_master(&paths, Signal::SIGTERM),
        Command::Reload => signal_master(&paths, Signal::SIGUSR1),
    }
}

fn print_answer<Q>(client: &RelayClient) -> Result<i32>
where
    Q: RelayQuery,
    Q::Response: Serialize,
{
    match client.query::<Q>()? {
        QueryOutcome::Answered(answer) => {
            println!("{}", serde_json::to_string_pretty(&answer)?);
            Ok(0)
        }
        QueryOutcome::NotRunning => {
            eprintln!("prochive is not running");
            Ok(1)
        }
    }
}

fn signal_master(paths: &RunPaths, signal: Signal) -> Result<i32> {
    let Some(pid) = running_master(&paths.pid_file) else {
        eprintln!("prochive is not running");
        return Ok(1);
    };
    let raw = i32::try_from(pid)
        .map_err(|_| AppError::Supervision(format!("invalid pid {pid}")))?;
    kill(Pid::from_raw(raw), signal)?;
    println!("OK");
    Ok(0)
}

/// `prochive` next to this executable, the usual install layout.
fn sibling_server_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name("prochive"))
}
