//! Creation of child processes and master daemonisation.
//!
//! Children are the server's own executable started again with a role
//! marker in the environment. They rebuild the same configuration, find
//! their template by id and run it; nothing from the master's memory is
//! inherited.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::bus::SOCKET_ENV;
use crate::models::template::ROLE_ENV;
use crate::models::ChildRole;
use crate::{AppError, Result};

/// Environment marker of the daemonised master.
pub const DAEMON_ENV: &str = "PROCHIVE_DAEMON";

/// Starts the OS process for a child role.
pub trait ChildLauncher: Send {
    /// Start a process for `role` that connects to the bus at `socket`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Supervision` when the process cannot be created.
    fn launch(&mut self, role: ChildRole, socket: &Path) -> Result<Child>;
}

/// Launches children by re-executing the current binary.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExecLauncher {
    /// Launcher for the running executable with its original arguments.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the executable path is unavailable.
    pub fn current() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
        })
    }

    /// Launcher for an explicit program and arguments.
    #[must_use]
    pub fn new(program: PathBuf, args: Vec<OsString>) -> Self {
        Self { program, args }
    }
}

impl ChildLauncher for ExecLauncher {
    fn launch(&mut self, role: ChildRole, socket: &Path) -> Result<Child> {
        debug!(%role, program = %self.program.display(), "launching child");
        Command::new(&self.program)
            .args(&self.args)
            .env(ROLE_ENV, role.to_string())
            .env(SOCKET_ENV, socket)
            .env_remove(DAEMON_ENV)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| AppError::Supervision(format!("cannot start {role}: {err}")))
    }
}

/// Which side of daemonisation the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Daemonized {
    /// The original process; the daemon runs as this pid.
    Parent(u32),
    /// The detached daemon, now a session leader.
    Daemon,
}

/// Detach the master from its terminal.
///
/// The first call re-executes the binary with stdio detached and returns
/// [`Daemonized::Parent`]. Inside the re-executed process the call makes
/// it a session leader and returns [`Daemonized::Daemon`].
///
/// # Errors
///
/// Returns `AppError::Supervision` when the daemon cannot be started or
/// cannot become a session leader.
pub fn daemonize() -> Result<Daemonized> {
    if std::env::var_os(DAEMON_ENV).is_some() {
        nix::unistd::setsid()
            .map_err(|err| AppError::Supervision(format!("cannot become session leader: {err}")))?;
        return Ok(Daemonized::Daemon);
    }

    let program = std::env::current_exe()?;
    let child = std::process::Command::new(program)
        .args(std::env::args_os().skip(1))
        .env(DAEMON_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| AppError::Supervision(format!("cannot start daemon: {err}")))?;
    Ok(Daemonized::Parent(child.id()))
}
