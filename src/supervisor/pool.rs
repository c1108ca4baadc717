//! Registry of worker templates and their live children.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::{TemplateId, WorkerTemplate};
use crate::{AppError, Result};

/// Supervision record of one live child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    /// OS pid.
    pub pid: u32,
    /// Owning template.
    pub template_id: TemplateId,
    /// Copied from the template.
    pub reloadable: bool,
    /// Child relinquished supervision.
    pub detached: bool,
    /// Heartbeat overdue.
    pub blocked: bool,
    /// Set when the current stall was flagged; cleared by a heartbeat.
    pub blocked_until: Option<Instant>,
    /// Last sign of life.
    pub last_heartbeat: Instant,
    /// Resident memory from the last heartbeat.
    pub memory: u64,
}

/// A change of a child's blocked flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedChange {
    /// Child pid.
    pub pid: u32,
    /// New flag value.
    pub blocked: bool,
}

/// Worker templates and children, mutated only by the master loop.
#[derive(Debug, Default)]
pub struct WorkerPool {
    templates: BTreeMap<TemplateId, Arc<WorkerTemplate>>,
    processes: BTreeMap<TemplateId, BTreeMap<u32, ProcessStatus>>,
    running: bool,
}

impl WorkerPool {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the pool is running or the id or
    /// name is already registered.
    pub fn register_worker(&mut self, template: WorkerTemplate) -> Result<Arc<WorkerTemplate>> {
        if self.running {
            return Err(AppError::Config(format!(
                "cannot register worker '{}' while the pool is running",
                template.name
            )));
        }
        if self.templates.contains_key(&template.id) {
            return Err(AppError::Config(format!(
                "worker id {} is already registered",
                template.id
            )));
        }
        if self.templates.values().any(|t| t.name == template.name) {
            return Err(AppError::Config(format!(
                "worker '{}' is already registered",
                template.name
            )));
        }
        let template = Arc::new(template);
        self.processes.insert(template.id, BTreeMap::new());
        self.templates.insert(template.id, Arc::clone(&template));
        Ok(template)
    }

    /// Mark the pool as running; registration is closed afterwards.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Whether registration is closed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Registered templates in id order.
    pub fn templates(&self) -> impl Iterator<Item = &Arc<WorkerTemplate>> {
        self.templates.values()
    }

    /// Template by id.
    #[must_use]
    pub fn template(&self, id: TemplateId) -> Option<&Arc<WorkerTemplate>> {
        self.templates.get(&id)
    }

    /// Record a new child of `template`.
    ///
    /// Returns `false` when the template is unknown.
    pub fn add_child(&mut self, template: TemplateId, pid: u32, now: Instant) -> bool {
        let Some(reloadable) = self.templates.get(&template).map(|t| t.reloadable) else {
            return false;
        };
        self.processes.entry(template).or_default().insert(
            pid,
            ProcessStatus {
                pid,
                template_id: template,
                reloadable,
                detached: false,
                blocked: false,
                blocked_until: None,
                last_heartbeat: now,
                memory: 0,
            },
        );
        true
    }

    /// Forget a child; returns its last record.
    pub fn mark_as_deleted(&mut self, pid: u32) -> Option<ProcessStatus> {
        self.processes
            .values_mut()
            .find_map(|children| children.remove(&pid))
    }

    /// Exclude a child from metrics and blocked detection.
    pub fn mark_as_detached(&mut self, pid: u32) -> bool {
        self.find_mut(pid).is_some_and(|status| {
            status.detached = true;
            status.blocked = false;
            status.blocked_until = None;
            true
        })
    }

    /// Flag a child as blocked until `until`.
    ///
    /// Returns `true` when the flag was newly set.
    pub fn mark_as_blocked(&mut self, pid: u32, until: Instant) -> bool {
        match self.find_mut(pid) {
            Some(status) if !status.detached && !status.blocked => {
                status.blocked = true;
                status.blocked_until = Some(until);
                true
            }
            _ => false,
        }
    }

    /// Record a heartbeat.
    ///
    /// Returns `true` when the child was blocked before.
    pub fn mark_as_healthy(&mut self, pid: u32, memory: u64, now: Instant) -> bool {
        self.find_mut(pid).is_some_and(|status| {
            let was_blocked = status.blocked;
            status.blocked = false;
            status.blocked_until = None;
            status.last_heartbeat = now;
            status.memory = memory;
            was_blocked
        })
    }

    /// Flag children whose heartbeat is older than `threshold` and clear
    /// flags older than `persistence`.
    ///
    /// A stall is flagged once; after its flag expires the child stays
    /// unflagged until a heartbeat arrives and it stalls again.
    pub fn check_blocked(
        &mut self,
        now: Instant,
        threshold: Duration,
        persistence: Duration,
    ) -> Vec<BlockedChange> {
        let mut changes = Vec::new();
        for status in self.processes.values_mut().flat_map(BTreeMap::values_mut) {
            if status.detached {
                continue;
            }
            match (status.blocked, status.blocked_until) {
                (true, Some(until)) if until <= now => {
                    status.blocked = false;
                    changes.push(BlockedChange {
                        pid: status.pid,
                        blocked: false,
                    });
                }
                (false, None) if now.saturating_duration_since(status.last_heartbeat) > threshold => {
                    status.blocked = true;
                    status.blocked_until = Some(now + persistence);
                    changes.push(BlockedChange {
                        pid: status.pid,
                        blocked: true,
                    });
                }
                _ => {}
            }
        }
        changes
    }

    /// Template owning `pid`.
    #[must_use]
    pub fn template_of(&self, pid: u32) -> Option<TemplateId> {
        self.processes
            .iter()
            .find(|(_, children)| children.contains_key(&pid))
            .map(|(id, _)| *id)
    }

    /// Record of `pid`.
    #[must_use]
    pub fn process(&self, pid: u32) -> Option<&ProcessStatus> {
        self.processes.values().find_map(|children| children.get(&pid))
    }

    /// Pids of every live child.
    #[must_use]
    pub fn alive_pids(&self) -> Vec<u32> {
        self.processes().map(|status| status.pid).collect()
    }

    /// Pids of the live children of one template.
    #[must_use]
    pub fn alive_pids_of(&self, template: TemplateId) -> Vec<u32> {
        self.processes
            .get(&template)
            .map(|children| children.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every live child record.
    pub fn processes(&self) -> impl Iterator<Item = &ProcessStatus> {
        self.processes.values().flat_map(BTreeMap::values)
    }

    /// Registered template count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.templates.len()
    }

    /// Live child count.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.values().map(BTreeMap::len).sum()
    }

    fn find_mut(&mut self, pid: u32) -> Option<&mut ProcessStatus> {
        self.processes
            .values_mut()
            .find_map(|children| children.get_mut(&pid))
    }
}
