//! Aggregate server status maintained by the master from bus events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::bus::BusMessage;
use crate::models::{
    Connection, PeriodicInfo, ProcessInfo, RoleKind, ServerStatusSnapshot, WorkerInfo,
    WorkerTemplate,
};
use crate::runtime::privileges::current_user_name;

/// Live metrics and configuration of a running master.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    entrypoint: String,
    master_pid: u32,
    started_at: Option<DateTime<Utc>>,
    running: bool,
    workers: Vec<WorkerInfo>,
    periodic: Vec<PeriodicInfo>,
    processes: BTreeMap<u32, ProcessInfo>,
    connections: BTreeMap<(u32, u64), Connection>,
}

impl ServerStatus {
    /// Empty status for the master at `master_pid`.
    #[must_use]
    pub fn new(entrypoint: impl Into<String>, master_pid: u32) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            master_pid,
            started_at: None,
            running: false,
            workers: Vec::new(),
            periodic: Vec::new(),
            processes: BTreeMap::new(),
            connections: BTreeMap::new(),
        }
    }

    /// List a worker template.
    pub fn add_worker(&mut self, template: &WorkerTemplate) {
        self.workers.push(WorkerInfo {
            id: template.id,
            name: template.name.clone(),
            user: template.user.clone().unwrap_or_else(current_user_name),
            count: template.count,
            reloadable: template.reloadable,
        });
    }

    /// Replace the periodic task listing.
    pub fn set_periodic(&mut self, periodic: Vec<PeriodicInfo>) {
        self.periodic = periodic;
    }

    /// Enter the running state.
    pub fn set_running(&mut self, now: DateTime<Utc>) {
        self.running = true;
        self.started_at = Some(now);
    }

    /// Leave the running state.
    pub fn set_stopped(&mut self) {
        self.running = false;
    }

    /// Whether the master is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Apply a child event; returns whether it changed anything.
    pub fn apply(&mut self, message: &BusMessage) -> bool {
        match message {
            BusMessage::ProcessSpawned(spawned) => {
                if spawned.kind != RoleKind::Worker {
                    return false;
                }
                self.processes.insert(
                    spawned.pid,
                    ProcessInfo {
                        pid: spawned.pid,
                        template_id: spawned.template_id,
                        user: spawned.user.clone(),
                        name: spawned.name.clone(),
                        started_at: spawned.started_at,
                        memory: 0,
                        requests: 0,
                        rx: 0,
                        tx: 0,
                        connections: 0,
                        blocked: false,
                        detached: false,
                    },
                );
                true
            }
            BusMessage::Heartbeat(heartbeat) => self.update(heartbeat.pid, |process| {
                if !process.detached {
                    process.memory = heartbeat.memory;
                }
            }),
            BusMessage::Detached(detached) => {
                self.connections.retain(|(pid, _), _| *pid != detached.pid);
                self.update(detached.pid, |process| {
                    process.detached = true;
                    process.blocked = false;
                    process.memory = 0;
                    process.requests = 0;
                    process.rx = 0;
                    process.tx = 0;
                    process.connections = 0;
                })
            }
            BusMessage::RxIncrement(inc) => self.update(inc.pid, |process| {
                process.rx = process.rx.saturating_add(inc.bytes);
            }),
            BusMessage::TxIncrement(inc) => self.update(inc.pid, |process| {
                process.tx = process.tx.saturating_add(inc.bytes);
            }),
            BusMessage::RequestIncrement(inc) => self.update(inc.pid, |process| {
                process.requests = process.requests.saturating_add(inc.requests);
            }),
            BusMessage::ConnectionOpened(opened) => {
                let connection = &opened.connection;
                let known = self.update(connection.pid, |process| {
                    process.connections = process.connections.saturating_add(1);
                });
                if known {
                    self.connections
                        .insert((connection.pid, connection.id), connection.clone());
                }
                known
            }
            BusMessage::ConnectionClosed(closed) => {
                if self
                    .connections
                    .remove(&(closed.pid, closed.connection_id))
                    .is_none()
                {
                    return false;
                }
                self.update(closed.pid, |process| {
                    process.connections = process.connections.saturating_sub(1);
                })
            }
            BusMessage::Composite(composite) => composite
                .messages
                .iter()
                .fold(false, |changed, inner| self.apply(inner) || changed),
            _ => false,
        }
    }

    /// Forget a child and its connections.
    pub fn delete_process(&mut self, pid: u32) -> bool {
        self.connections.retain(|(owner, _), _| *owner != pid);
        self.processes.remove(&pid).is_some()
    }

    /// Set a child's blocked flag.
    pub fn set_blocked(&mut self, pid: u32, blocked: bool) -> bool {
        self.update(pid, |process| process.blocked = blocked)
    }

    /// Open connections of every child.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.connections.values().cloned().collect()
    }

    /// Point-in-time copy for the bus and the relay.
    #[must_use]
    pub fn snapshot(&self) -> ServerStatusSnapshot {
        let processes: Vec<ProcessInfo> = self.processes.values().cloned().collect();
        let counted = || processes.iter().filter(|p| !p.detached);
        ServerStatusSnapshot {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            entrypoint: self.entrypoint.clone(),
            master_pid: self.master_pid,
            started_at: self.started_at,
            is_running: self.running,
            workers: self.workers.clone(),
            periodic: self.periodic.clone(),
            processes_count: processes.len(),
            total_memory: counted().map(|p| p.memory).sum(),
            total_connections: counted().map(|p| u64::from(p.connections)).sum(),
            total_requests: counted().map(|p| p.requests).sum(),
            processes,
        }
    }

    fn update(&mut self, pid: u32, apply: impl FnOnce(&mut ProcessInfo)) -> bool {
        match self.processes.get_mut(&pid) {
            Some(process) => {
                apply(process);
                true
            }
            None => false,
        }
    }
}
