//! PID file handling.

use std::fs;
use std::path::Path;

use crate::supervisor::signal::process_alive;
use crate::{AppError, Result};

/// Pid recorded in `path`, if the file exists and parses.
#[must_use]
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Pid of a live master owning `path`.
///
/// A file naming a dead process is stale and yields `None`.
#[must_use]
pub fn running_master(path: &Path) -> Option<u32> {
    read_pid(path).filter(|pid| process_alive(*pid))
}

/// Record `pid` in `path`.
///
/// # Errors
///
/// Returns `AppError::Io` when the file cannot be written.
pub fn write_pid(path: &Path, pid: u32) -> Result<()> {
    fs::write(path, pid.to_string())
        .map_err(|err| AppError::Io(format!("cannot write pid file '{}': {err}", path.display())))
}
