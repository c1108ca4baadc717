//! Run-time file locations derived from the executable path.
//!
//! Names embed the first four bytes of a SHA-256 digest, so two servers
//! started from different executables never collide in the same run
//! directory.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};
use sha2::{Digest, Sha256};

use crate::Result;

const PREFIX: &str = "prochive";

/// PID file, FIFO pair and bus socket of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// Executable the server was started from.
    pub entrypoint: PathBuf,
    /// Directory holding the run-time files.
    pub run_dir: PathBuf,
    /// Decimal pid of the master.
    pub pid_file: PathBuf,
    /// Relay requests, read by the master.
    pub rx_fifo: PathBuf,
    /// Relay responses, written by the master.
    pub tx_fifo: PathBuf,
    /// Message bus socket.
    pub socket: PathBuf,
}

impl RunPaths {
    /// Paths for `entrypoint`.
    ///
    /// With an explicit PID file the run directory is its parent;
    /// otherwise `/run` when readable and writable, else the temp dir.
    #[must_use]
    pub fn resolve(entrypoint: &Path, pid_file: Option<&Path>) -> Self {
        let entry = entrypoint.to_string_lossy();
        let run_dir = match pid_file.and_then(Path::parent) {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => default_run_dir(),
        };
        let pid_file = pid_file.map_or_else(
            || run_dir.join(format!("{PREFIX}{}.pid", short_hash(&entry))),
            Path::to_path_buf,
        );
        Self {
            entrypoint: entrypoint.to_path_buf(),
            rx_fifo: run_dir.join(format!("{PREFIX}{}.pipe", short_hash(&format!("{entry}rx")))),
            tx_fifo: run_dir.join(format!("{PREFIX}{}.pipe", short_hash(&format!("{entry}tx")))),
            socket: run_dir.join(format!("{PREFIX}{}.sock", short_hash(&format!("{entry}socket")))),
            run_dir,
            pid_file,
        }
    }

    /// Paths for the running executable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the executable path is unavailable.
    pub fn for_current_exe(pid_file: Option<&Path>) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::resolve(&exe, pid_file))
    }

    /// Every file the master creates.
    #[must_use]
    pub fn owned_files(&self) -> [&Path; 4] {
        [&self.pid_file, &self.rx_fifo, &self.tx_fifo, &self.socket]
    }
}

/// First four bytes of the SHA-256 of `input`, as lowercase hex.
#[must_use]
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(4).fold(String::with_capacity(8), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

fn default_run_dir() -> PathBuf {
    let run = Path::new("/run");
    if access(run, AccessFlags::R_OK | AccessFlags::W_OK).is_ok() {
        run.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
