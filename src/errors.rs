//! Error types shared across the supervisor.

use std::fmt::{Display, Formatter};

/// Shared result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every supervision failure mode.
#[derive(Debug)]
pub enum AppError {
    /// Invalid configuration: duplicate registration, bad external command,
    /// malformed TOML. Fatal before any process is spawned.
    Config(String),
    /// A lifecycle handler failed inside a child process.
    Hook(String),
    /// Bus or relay dispatch to an unreachable peer.
    Transport(String),
    /// The process could not switch to the configured user or group.
    Privilege(String),
    /// Spawn, session-leader or runtime state-machine failure.
    Supervision(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Hook(msg) => write!(f, "hook: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Privilege(msg) => write!(f, "privilege: {msg}"),
            Self::Supervision(msg) => write!(f, "supervision: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transport(format!("malformed frame: {err}"))
    }
}

impl From<nix::errno::Errno> for AppError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Io(err.desc().to_owned())
    }
}
