//! Serialisable status records served over the bus and the relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::template::TemplateId;

/// Live metrics of one worker child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessInfo {
    /// OS process id.
    pub pid: u32,
    /// Template the child was started from.
    pub template_id: TemplateId,
    /// OS user the child runs as.
    pub user: String,
    /// Template name.
    pub name: String,
    /// Wall-clock start time reported by the child.
    pub started_at: DateTime<Utc>,
    /// Resident memory in bytes from the last heartbeat.
    pub memory: u64,
    /// Requests handled.
    pub requests: u64,
    /// Bytes received.
    pub rx: u64,
    /// Bytes sent.
    pub tx: u64,
    /// Open connections.
    pub connections: u32,
    /// Heartbeat overdue.
    pub blocked: bool,
    /// Child relinquished its supervised resources.
    pub detached: bool,
}

/// Configured worker template as listed in status output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerInfo {
    /// Template id.
    pub id: TemplateId,
    /// Template name.
    pub name: String,
    /// Effective OS user.
    pub user: String,
    /// Desired replica count.
    pub count: u32,
    /// Whether replicas honour reload requests.
    pub reloadable: bool,
}

/// Configured periodic task as listed in status output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PeriodicInfo {
    /// Template id.
    pub id: TemplateId,
    /// Task name.
    pub name: String,
    /// Effective OS user.
    pub user: String,
    /// Raw schedule expression.
    pub schedule: String,
    /// Next run; `None` when the schedule could not be parsed.
    pub next_run: Option<DateTime<Utc>>,
}

/// One client connection reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Connection {
    /// Worker owning the connection.
    pub pid: u32,
    /// Worker-local connection id.
    pub id: u64,
    /// Local socket address.
    pub local_address: String,
    /// Peer socket address.
    pub remote_address: String,
    /// When the connection was accepted.
    pub opened_at: DateTime<Utc>,
    /// Bytes received on this connection.
    #[serde(default)]
    pub rx: u64,
    /// Bytes sent on this connection.
    #[serde(default)]
    pub tx: u64,
}

/// Aggregate view of a running master, rebuilt incrementally from bus events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerStatusSnapshot {
    /// Crate version of the master.
    pub version: String,
    /// Path of the executable the master was started from.
    pub entrypoint: String,
    /// Master process id.
    pub master_pid: u32,
    /// When the master entered its running state.
    pub started_at: Option<DateTime<Utc>>,
    /// Whether the master is running.
    pub is_running: bool,
    /// Configured worker templates.
    pub workers: Vec<WorkerInfo>,
    /// Configured periodic tasks.
    pub periodic: Vec<PeriodicInfo>,
    /// Live worker children.
    pub processes: Vec<ProcessInfo>,
    /// Number of live worker children.
    pub processes_count: usize,
    /// Sum of resident memory across live children.
    pub total_memory: u64,
    /// Sum of open connections across live children.
    pub total_connections: u64,
    /// Sum of handled requests across live children.
    pub total_requests: u64,
}
