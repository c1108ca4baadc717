//! Worker supervision: replica start, crash respawn, reload and stop.
//!
//! The supervisor never creates processes itself. It pushes
//! [`SpawnRequest`]s into the spawn channel and the master loop executes
//! them before handling its next event. Exits, heartbeats and spawn
//! confirmations are fed back by the loop.

pub mod pool;
pub mod restart;
pub mod signal;
pub mod stop;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::models::{ProcessKind, SpawnReason, SpawnRequest, TemplateId, WorkerTemplate};
use crate::runtime::RELOAD_EXIT_CODE;
use crate::{AppError, Result};

use pool::{BlockedChange, WorkerPool};
use restart::{RestartDecision, RestartGuard, RestartPolicy};
use signal::{ChildSignal, ProcessSignaller};
use stop::StopTracker;

/// Timing knobs of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Grace period between `SIGTERM` and `SIGKILL`.
    pub stop_timeout: Duration,
    /// Heartbeat age after which a child is flagged blocked.
    pub blocked_threshold: Duration,
    /// How long a blocked flag persists without a heartbeat.
    pub blocked_persistence: Duration,
    /// Crash respawn limits.
    pub restart: RestartPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(15),
            blocked_threshold: crate::runtime::DEFAULT_HEARTBEAT_PERIOD * 6,
            blocked_persistence: Duration::from_secs(30),
            restart: RestartPolicy::default(),
        }
    }
}

/// Lifecycle of the supervisor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Accepting registrations.
    Idle,
    /// Replicas requested.
    Running,
    /// Children asked to stop.
    Stopping,
}

/// Keeps the desired number of replicas of every worker template alive.
pub struct Supervisor {
    pool: WorkerPool,
    signaller: Arc<dyn ProcessSignaller>,
    spawn_tx: mpsc::UnboundedSender<SpawnRequest>,
    options: SupervisorOptions,
    guard: RestartGuard,
    state: SupervisorState,
    stopping: StopTracker,
    exit_notices: HashMap<u32, i32>,
    reload_requested: HashSet<u32>,
    delayed: Vec<(Instant, TemplateId)>,
}

impl Supervisor {
    /// Supervisor signalling through `signaller` and requesting spawns on
    /// `spawn_tx`.
    #[must_use]
    pub fn new(
        signaller: Arc<dyn ProcessSignaller>,
        spawn_tx: mpsc::UnboundedSender<SpawnRequest>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            pool: WorkerPool::new(),
            signaller,
            spawn_tx,
            options,
            guard: RestartGuard::new(options.restart),
            state: SupervisorState::Idle,
            stopping: StopTracker::new(options.stop_timeout),
            exit_notices: HashMap::new(),
            reload_requested: HashSet::new(),
            delayed: Vec::new(),
        }
    }

    /// Add a worker template.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on duplicates or after start.
    pub fn register_worker(&mut self, template: WorkerTemplate) -> Result<Arc<WorkerTemplate>> {
        self.pool.register_worker(template)
    }

    /// Read access to the pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Request `count` replicas of every template.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Supervision` when already started.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SupervisorState::Idle {
            return Err(AppError::Supervision("supervisor already started".into()));
        }
        self.pool.set_running(true);
        self.state = SupervisorState::Running;

        let templates: Vec<_> = self.pool.templates().cloned().collect();
        for template in templates {
            info!(worker = %template.name, count = template.count, "starting worker replicas");
            for _ in 0..template.count {
                self.request_spawn(ProcessKind::Worker(Arc::clone(&template)), SpawnReason::Initial);
            }
        }
        Ok(())
    }

    /// Record a child the master loop just created.
    pub fn on_spawned(&mut self, template: TemplateId, pid: u32, now: Instant) -> bool {
        let added = self.pool.add_child(template, pid, now);
        if added && self.state == SupervisorState::Stopping {
            // Spawned after stop began: stop it too.
            self.stopping
                .terminate_all([pid], now, self.signaller.as_ref());
        }
        added
    }

    /// Record a heartbeat; returns `true` when a blocked flag was cleared.
    pub fn on_heartbeat(&mut self, pid: u32, memory: u64, now: Instant) -> bool {
        self.pool.mark_as_healthy(pid, memory, now)
    }

    /// Record a detachment.
    pub fn on_detached(&mut self, pid: u32) -> bool {
        self.pool.mark_as_detached(pid)
    }

    /// Record a child's stop acknowledgement.
    pub fn on_exiting(&mut self, pid: u32, exit_code: i32) {
        if self.pool.process(pid).is_some() {
            self.exit_notices.insert(pid, exit_code);
        }
    }

    /// React to a reaped child.
    ///
    /// `code` is `None` when the child was killed by a signal. Returns the
    /// template the child belonged to, or `None` for unknown pids.
    pub fn on_child_exit(&mut self, pid: u32, code: Option<i32>, now: Instant) -> Option<TemplateId> {
        let status = self.pool.mark_as_deleted(pid)?;
        self.stopping.forget(pid);
        let announced = self.exit_notices.remove(&pid);
        let reloading = self.reload_requested.remove(&pid);
        let template_id = status.template_id;
        let template = self.pool.template(template_id).cloned()?;

        if self.state != SupervisorState::Running {
            debug!(pid, worker = %template.name, ?code, "worker exited during stop");
            return Some(template_id);
        }

        // A child asked to reload is replaced at once whatever its status;
        // a detached program cannot report the reload code.
        if reloading || code == Some(RELOAD_EXIT_CODE) {
            info!(pid, worker = %template.name, ?code, "worker reloaded; respawning");
            self.request_spawn(ProcessKind::Worker(template), SpawnReason::Reload);
            return Some(template_id);
        }

        match code {
            Some(0) => warn!(pid, worker = %template.name, ?announced, "worker exited unexpectedly"),
            _ => error!(pid, worker = %template.name, ?code, ?announced, "worker crashed"),
        }

        match self.guard.on_crash(template_id, now) {
            RestartDecision::RespawnAfter(delay) => {
                debug!(worker = %template.name, delay = %humantime::format_duration(delay), "respawn scheduled");
                self.delayed.push((now + delay, template_id));
            }
            RestartDecision::GiveUp { crashes } => {
                error!(
                    worker = %template.name,
                    crashes,
                    window = %humantime::format_duration(self.guard.policy().window),
                    "worker keeps crashing; leaving it degraded"
                );
            }
        }
        Some(template_id)
    }

    /// Push the crash respawns whose backoff has elapsed.
    ///
    /// Returns how many were requested.
    pub fn due_respawns(&mut self, now: Instant) -> usize {
        if self.state != SupervisorState::Running {
            self.delayed.clear();
            return 0;
        }
        let (due, later): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = later;

        let mut requested = 0;
        for (_, id) in due {
            if let Some(template) = self.pool.template(id).cloned() {
                self.request_spawn(ProcessKind::Worker(template), SpawnReason::Crash);
                requested += 1;
            }
        }
        requested
    }

    /// Ask every reloadable child to reload.
    ///
    /// Detached children run a foreign program, so they are terminated
    /// instead of sent the reload signal. Returns the pids signalled.
    pub fn reload(&mut self) -> Vec<u32> {
        if self.state != SupervisorState::Running {
            return Vec::new();
        }
        let targets: Vec<(u32, ChildSignal)> = self
            .pool
            .processes()
            .filter(|status| status.reloadable)
            .map(|status| {
                let signal = if status.detached {
                    ChildSignal::Terminate
                } else {
                    ChildSignal::Reload
                };
                (status.pid, signal)
            })
            .collect();
        for &(pid, signal) in &targets {
            match self.signaller.send(pid, signal) {
                Ok(()) => {
                    self.reload_requested.insert(pid);
                }
                Err(err) => debug!(pid, %err, "reload signal not delivered"),
            }
        }
        let targets: Vec<u32> = targets.into_iter().map(|(pid, _)| pid).collect();
        info!(count = targets.len(), "reload requested");
        targets
    }

    /// Ask every child to stop; idempotent.
    pub fn stop(&mut self, now: Instant) {
        if self.state == SupervisorState::Stopping {
            return;
        }
        self.state = SupervisorState::Stopping;
        self.delayed.clear();
        self.reload_requested.clear();
        let pids = self.pool.alive_pids();
        info!(count = pids.len(), "stopping workers");
        self.stopping
            .terminate_all(pids, now, self.signaller.as_ref());
    }

    /// Kill children past their stop deadline.
    pub fn sweep(&mut self, now: Instant) -> Vec<u32> {
        self.stopping.sweep(now, self.signaller.as_ref())
    }

    /// Whether stop was requested and every child is gone.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state == SupervisorState::Stopping && self.pool.process_count() == 0
    }

    /// Update blocked flags; returns the changes.
    pub fn check_blocked(&mut self, now: Instant) -> Vec<BlockedChange> {
        let changes = self.pool.check_blocked(
            now,
            self.options.blocked_threshold,
            self.options.blocked_persistence,
        );
        for change in &changes {
            if change.blocked {
                warn!(pid = change.pid, "worker heartbeat overdue; flagged blocked");
            } else {
                debug!(pid = change.pid, "blocked flag expired");
            }
        }
        changes
    }

    fn request_spawn(&self, kind: ProcessKind, reason: SpawnReason) {
        if self.spawn_tx.send(SpawnRequest { kind, reason }).is_err() {
            warn!("spawn channel closed; request dropped");
        }
    }
}
