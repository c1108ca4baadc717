//! Periodic task scheduling.
//!
//! Each task carries a parsed [`Schedule`] and its next run time. The
//! master calls [`Scheduler::tick`] once per second; due tasks request a
//! transient child through the spawn channel and their next run is
//! recomputed from the current time, so missed runs are never replayed.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::models::{
    PeriodicInfo, PeriodicTemplate, ProcessKind, SpawnReason, SpawnRequest, TemplateId,
};
use crate::runtime::privileges::current_user_name;
use crate::supervisor::signal::ProcessSignaller;
use crate::supervisor::stop::StopTracker;
use crate::{AppError, Result};

/// When a task runs.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Cron expression with a seconds field.
    Cron(Box<cron::Schedule>),
    /// Fixed interval.
    Every(Duration),
}

impl Schedule {
    /// First run strictly after `now`.
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule.after(&now).next(),
            Self::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|step| now.checked_add_signed(step)),
        }
    }
}

impl FromStr for Schedule {
    type Err = AppError;

    /// Accepts `every 30s`, a bare interval such as `5 minutes`, or a cron
    /// expression with five or six fields.
    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let interval_text = trimmed.strip_prefix("every ").unwrap_or(trimmed);
        let compact: String = interval_text.split_whitespace().collect();
        if let Ok(interval) = humantime::parse_duration(&compact) {
            if interval.is_zero() {
                return Err(AppError::Config(format!("schedule '{raw}' has a zero interval")));
            }
            return Ok(Self::Every(interval));
        }

        cron::Schedule::from_str(&normalize_cron_expr(trimmed))
            .map(|schedule| Self::Cron(Box::new(schedule)))
            .map_err(|err| AppError::Config(format!("invalid schedule '{raw}': {err}")))
    }
}

/// Prepend a zero seconds field to standard five-field expressions.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_owned()
    }
}

/// A registered task and its timing state.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    /// Task template.
    pub template: Arc<PeriodicTemplate>,
    /// Parsed schedule; `None` when the expression is invalid.
    pub schedule: Option<Schedule>,
    /// Next run.
    pub next_run: Option<DateTime<Utc>>,
    /// Pid of the run in progress.
    pub running_pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

/// Runs periodic tasks as transient children.
pub struct Scheduler {
    tasks: BTreeMap<TemplateId, PeriodicTask>,
    signaller: Arc<dyn ProcessSignaller>,
    spawn_tx: mpsc::UnboundedSender<SpawnRequest>,
    state: SchedulerState,
    stopping: StopTracker,
}

impl Scheduler {
    /// Scheduler requesting spawns on `spawn_tx`; running tasks get
    /// `stop_timeout` to exit on shutdown.
    #[must_use]
    pub fn new(
        signaller: Arc<dyn ProcessSignaller>,
        spawn_tx: mpsc::UnboundedSender<SpawnRequest>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            tasks: BTreeMap::new(),
            signaller,
            spawn_tx,
            state: SchedulerState::Idle,
            stopping: StopTracker::new(stop_timeout),
        }
    }

    /// Register a task.
    ///
    /// An unparsable schedule is logged; the task is listed but never run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` after start or on a duplicate id or name.
    pub fn register(&mut self, template: PeriodicTemplate) -> Result<Arc<PeriodicTemplate>> {
        if self.state != SchedulerState::Idle {
            return Err(AppError::Config(format!(
                "cannot register periodic task '{}' after start",
                template.name
            )));
        }
        if self.tasks.contains_key(&template.id)
            || self.tasks.values().any(|t| t.template.name == template.name)
        {
            return Err(AppError::Config(format!(
                "periodic task '{}' is already registered",
                template.name
            )));
        }

        let schedule = match template.schedule.parse::<Schedule>() {
            Ok(schedule) => Some(schedule),
            Err(err) => {
                error!(task = %template.name, %err, "periodic task will never run");
                None
            }
        };
        let template = Arc::new(template);
        self.tasks.insert(
            template.id,
            PeriodicTask {
                template: Arc::clone(&template),
                schedule,
                next_run: None,
                running_pid: None,
            },
        );
        Ok(template)
    }

    /// Compute the first run of every task.
    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.state != SchedulerState::Idle {
            return;
        }
        self.state = SchedulerState::Running;
        for task in self.tasks.values_mut() {
            task.next_run = task.schedule.as_ref().and_then(|s| s.next_after(now));
            debug!(task = %task.template.name, next_run = ?task.next_run, "task scheduled");
        }
    }

    /// Request a run of every due task and reschedule it from `now`.
    ///
    /// Returns the ids of the tasks that were started.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<TemplateId> {
        if self.state != SchedulerState::Running {
            return Vec::new();
        }
        let mut started = Vec::new();
        for task in self.tasks.values_mut() {
            let due = task.next_run.is_some_and(|at| at <= now);
            if !due {
                continue;
            }
            task.next_run = task.schedule.as_ref().and_then(|s| s.next_after(now));

            if let Some(pid) = task.running_pid {
                warn!(task = %task.template.name, pid, "previous run still active; skipping");
                continue;
            }
            info!(task = %task.template.name, "running periodic task");
            let request = SpawnRequest {
                kind: ProcessKind::Periodic(Arc::clone(&task.template)),
                reason: SpawnReason::Schedule,
            };
            if self.spawn_tx.send(request).is_err() {
                warn!("spawn channel closed; request dropped");
                continue;
            }
            started.push(task.template.id);
        }
        started
    }

    /// Record the pid of a run the master just created.
    pub fn on_spawned(&mut self, template: TemplateId, pid: u32, now: Instant) -> bool {
        let Some(task) = self.tasks.get_mut(&template) else {
            return false;
        };
        task.running_pid = Some(pid);
        if self.state == SchedulerState::Stopping {
            self.stopping
                .terminate_all([pid], now, self.signaller.as_ref());
        }
        true
    }

    /// Record the end of a run; returns its task id.
    pub fn on_exit(&mut self, pid: u32, code: Option<i32>) -> Option<TemplateId> {
        let task = self
            .tasks
            .values_mut()
            .find(|task| task.running_pid == Some(pid))?;
        task.running_pid = None;
        self.stopping.forget(pid);
        match code {
            Some(0) => debug!(task = %task.template.name, pid, "periodic run finished"),
            _ => error!(task = %task.template.name, pid, ?code, "periodic run failed"),
        }
        Some(task.template.id)
    }

    /// Stop scheduling and ask running tasks to exit; idempotent.
    pub fn stop(&mut self, now: Instant) {
        if self.state == SchedulerState::Stopping {
            return;
        }
        self.state = SchedulerState::Stopping;
        let pids: Vec<u32> = self.tasks.values().filter_map(|t| t.running_pid).collect();
        self.stopping
            .terminate_all(pids, now, self.signaller.as_ref());
    }

    /// Kill runs past their stop deadline.
    pub fn sweep(&mut self, now: Instant) -> Vec<u32> {
        self.stopping.sweep(now, self.signaller.as_ref())
    }

    /// Whether stop was requested and no run is left.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state == SchedulerState::Stopping
            && self.tasks.values().all(|t| t.running_pid.is_none())
    }

    /// Task by id.
    #[must_use]
    pub fn task(&self, id: TemplateId) -> Option<&PeriodicTask> {
        self.tasks.get(&id)
    }

    /// Listing for status output.
    #[must_use]
    pub fn tasks_info(&self) -> Vec<PeriodicInfo> {
        self.tasks
            .values()
            .map(|task| PeriodicInfo {
                id: task.template.id,
                name: task.template.name.clone(),
                user: task.template.user.clone().unwrap_or_else(current_user_name),
                schedule: task.template.schedule.clone(),
                next_run: task.next_run,
            })
            .collect()
    }
}
