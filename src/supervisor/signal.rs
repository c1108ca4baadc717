//! Signal delivery to child processes.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::{AppError, Result};

/// Signals the master sends to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildSignal {
    /// Graceful stop (`SIGTERM`).
    Terminate,
    /// Forced stop (`SIGKILL`).
    Kill,
    /// Graceful reload (`SIGUSR1`).
    Reload,
}

impl ChildSignal {
    fn as_nix(self) -> Signal {
        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
            Self::Reload => Signal::SIGUSR1,
        }
    }
}

/// Delivers signals to pids; swapped for a recorder in tests.
pub trait ProcessSignaller: Send + Sync {
    /// Send `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error when delivery fails, typically because the
    /// process is already gone.
    fn send(&self, pid: u32, signal: ChildSignal) -> Result<()>;
}

/// Production signaller backed by `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NixSignaller;

impl ProcessSignaller for NixSignaller {
    fn send(&self, pid: u32, signal: ChildSignal) -> Result<()> {
        kill(to_pid(pid)?, signal.as_nix())?;
        Ok(())
    }
}

/// Whether a process with `pid` exists (signal 0 check).
///
/// `EPERM` means the process exists but belongs to another user.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    to_pid(pid).is_ok_and(|pid| matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM)))
}

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| AppError::Supervision(format!("invalid pid {pid}")))
}
