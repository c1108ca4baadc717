//! The master process: owner of all supervision state.
//!
//! One cooperative loop on a current-thread runtime receives bus
//! messages, relay queries, child exits, signals and a one-second tick.
//! The supervisor and scheduler only push spawn requests; after every
//! handled event the loop drains that queue and creates the processes
//! itself, so no state is ever shared across tasks.

pub mod launcher;
pub mod module;
pub mod paths;
pub mod pidfile;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{spawn_bus_server, BusMessage, BusReply};
use crate::models::{
    PeriodicTemplate, ProcessKind, RoleKind, ServerStatusSnapshot, SpawnRequest, WorkerTemplate,
};
use crate::relay::{create_fifo, spawn_relay, RelayRequest, RelayResponse};
use crate::scheduler::Scheduler;
use crate::status::ServerStatus;
use crate::supervisor::signal::{ChildSignal, ProcessSignaller};
use crate::supervisor::{Supervisor, SupervisorOptions};
use crate::{AppError, Result};

use launcher::ChildLauncher;
use module::{MasterCommand, MasterHandle, Module};
use paths::RunPaths;
use pidfile::{running_master, write_pid};

/// Interval of the supervision tick.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Settings of a master process.
#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Run-time file locations.
    pub paths: RunPaths,
    /// Supervisor timing.
    pub supervisor: SupervisorOptions,
    /// Bound on the whole shutdown; `None` waits indefinitely.
    pub shutdown_timeout: Option<Duration>,
}

#[derive(Debug)]
enum LoopEvent {
    ChildExited { pid: u32, code: Option<i32> },
    ModulesStopped,
}

#[derive(Debug)]
struct Shutdown {
    deadline: Option<Instant>,
    modules_pending: bool,
}

/// Parent of every worker and periodic child.
pub struct MasterProcess {
    options: MasterOptions,
    supervisor: Supervisor,
    scheduler: Scheduler,
    status: ServerStatus,
    modules: Vec<Box<dyn Module>>,
    launcher: Box<dyn ChildLauncher>,
    signaller: Arc<dyn ProcessSignaller>,
    spawn_rx: mpsc::UnboundedReceiver<SpawnRequest>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    control_tx: mpsc::UnboundedSender<MasterCommand>,
    control_rx: mpsc::UnboundedReceiver<MasterCommand>,
    children: HashMap<u32, RoleKind>,
    shutdown: Option<Shutdown>,
    exit_code: i32,
}

impl MasterProcess {
    /// Assemble a master from frozen templates.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on duplicate templates or module names.
    pub fn new(
        options: MasterOptions,
        workers: Vec<WorkerTemplate>,
        periodic: Vec<PeriodicTemplate>,
        modules: Vec<Box<dyn Module>>,
        launcher: Box<dyn ChildLauncher>,
        signaller: Arc<dyn ProcessSignaller>,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        for module in &modules {
            if !names.insert(module.name().to_owned()) {
                return Err(AppError::Config(format!(
                    "module '{}' is registered twice",
                    module.name()
                )));
            }
        }

        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
        let mut supervisor =
            Supervisor::new(Arc::clone(&signaller), spawn_tx.clone(), options.supervisor);
        let mut scheduler = Scheduler::new(
            Arc::clone(&signaller),
            spawn_tx,
            options.supervisor.stop_timeout,
        );
        let mut status = ServerStatus::new(
            options.paths.entrypoint.to_string_lossy(),
            std::process::id(),
        );

        for template in workers {
            let template = supervisor.register_worker(template)?;
            status.add_worker(&template);
        }
        for template in periodic {
            scheduler.register(template)?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Ok(Self {
            options,
            supervisor,
            scheduler,
            status,
            modules,
            launcher,
            signaller,
            spawn_rx,
            events_tx,
            events_rx,
            control_tx,
            control_rx,
            children: HashMap::new(),
            shutdown: None,
            exit_code: 0,
        })
    }

    /// Handle for stopping or reloading this master from inside the process.
    #[must_use]
    pub fn handle(&self) -> MasterHandle {
        MasterHandle::new(self.control_tx.clone())
    }

    /// Run until shutdown completes and return the exit code.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Supervision` when another live master owns the
    /// PID file or a child cannot be started during startup, and
    /// `AppError::Io`/`AppError::Transport` when run-time files or the bus
    /// cannot be set up.
    pub async fn run(mut self) -> Result<i32> {
        let pid_file = self.options.paths.pid_file.clone();
        if let Some(pid) = running_master(&pid_file) {
            return Err(AppError::Supervision(format!(
                "another master is already running with pid {pid} ({})",
                pid_file.display()
            )));
        }

        let ct = CancellationToken::new();
        let result = self.serve(&ct).await;
        ct.cancel();
        self.cleanup();
        result
    }

    async fn serve(&mut self, ct: &CancellationToken) -> Result<i32> {
        let paths = self.options.paths.clone();
        write_pid(&paths.pid_file, std::process::id())?;
        create_fifo(&paths.rx_fifo)?;
        create_fifo(&paths.tx_fifo)?;

        let (bus_tx, mut bus_rx) = mpsc::unbounded_channel();
        spawn_bus_server(&paths.socket, bus_tx, ct.clone())?;
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        spawn_relay(&paths.rx_fifo, &paths.tx_fifo, relay_tx, ct.clone())?;

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut suspend = signal(SignalKind::from_raw(Signal::SIGTSTP as i32))?;
        let mut user1 = signal(SignalKind::user_defined1())?;

        for module in &mut self.modules {
            module.init(MasterHandle::new(self.control_tx.clone()))?;
            info!(module = module.name(), "module started");
        }

        self.supervisor.start()?;
        self.scheduler.start(Utc::now());
        self.launch_pending()?;
        self.status.set_running(Utc::now());
        info!(
            pid = std::process::id(),
            workers = self.supervisor.pool().worker_count(),
            "master running"
        );

        let mut tick = tokio::time::interval(TICK_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = self.shutdown.as_ref().and_then(|s| s.deadline);
            let deadline_at = deadline.unwrap_or_else(|| Instant::now() + TICK_PERIOD);

            tokio::select! {
                Some(envelope) = bus_rx.recv() => {
                    let reply = self.handle_message(&envelope.message);
                    let _ = envelope.reply.send(reply);
                }
                Some(envelope) = relay_rx.recv() => {
                    let _ = envelope.reply.send(self.answer_relay(envelope.request));
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(command) = self.control_rx.recv() => match command {
                    MasterCommand::Stop(code) => self.shutdown(code),
                    MasterCommand::Reload => self.reload(),
                },
                _ = interrupt.recv() => self.shutdown(0),
                _ = terminate.recv() => self.shutdown(0),
                _ = hangup.recv() => self.shutdown(0),
                _ = quit.recv() => self.shutdown(0),
                _ = suspend.recv() => self.shutdown(0),
                _ = user1.recv() => self.reload(),
                _ = tick.tick() => self.on_tick(),
                () = tokio::time::sleep_until(deadline_at), if deadline.is_some() => {
                    warn!("shutdown timed out; killing remaining children");
                    for pid in self.children.keys() {
                        let _ = self.signaller.send(*pid, ChildSignal::Kill);
                    }
                    break;
                }
            }

            if let Err(err) = self.launch_pending() {
                error!(%err, "cannot start child process; shutting down");
                self.shutdown(1);
            }
            if self.shutdown_complete() {
                break;
            }
        }

        info!(code = self.exit_code, "master stopped");
        Ok(self.exit_code)
    }

    /// Execute queued spawn requests.
    fn launch_pending(&mut self) -> Result<()> {
        while let Ok(request) = self.spawn_rx.try_recv() {
            if self.shutdown.is_some() {
                debug!(name = request.kind.name(), "dropping spawn request during shutdown");
                continue;
            }
            self.launch(&request)?;
        }
        Ok(())
    }

    fn launch(&mut self, request: &SpawnRequest) -> Result<()> {
        let role = request.kind.role();
        let mut child = self.launcher.launch(role, &self.options.paths.socket)?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::Supervision(format!("{role} exited before it was tracked")))?;

        let now = Instant::now().into_std();
        match &request.kind {
            ProcessKind::Worker(template) => {
                self.supervisor.on_spawned(template.id, pid, now);
            }
            ProcessKind::Periodic(template) => {
                self.scheduler.on_spawned(template.id, pid, now);
            }
        }
        self.children.insert(pid, role.kind);
        debug!(pid, name = request.kind.name(), reason = ?request.reason, "child started");

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(pid, %err, "cannot reap child");
                    None
                }
            };
            let _ = events.send(LoopEvent::ChildExited { pid, code });
        });
        Ok(())
    }

    fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::ChildExited { pid, code } => {
                let now = Instant::now().into_std();
                match self.children.remove(&pid) {
                    Some(RoleKind::Worker) => {
                        self.supervisor.on_child_exit(pid, code, now);
                        self.status.delete_process(pid);
                    }
                    Some(RoleKind::Periodic) => {
                        self.scheduler.on_exit(pid, code);
                    }
                    None => debug!(pid, "exit of an untracked child"),
                }
            }
            LoopEvent::ModulesStopped => {
                if let Some(shutdown) = self.shutdown.as_mut() {
                    shutdown.modules_pending = false;
                }
            }
        }
    }

    fn handle_message(&mut self, message: &BusMessage) -> BusReply {
        let now = Instant::now().into_std();
        match message {
            BusMessage::Composite(composite) => {
                for inner in &composite.messages {
                    if let BusReply::Error(err) = self.handle_message(inner) {
                        return BusReply::Error(err);
                    }
                }
                BusReply::Ack
            }
            BusMessage::Heartbeat(heartbeat) => {
                if self
                    .supervisor
                    .on_heartbeat(heartbeat.pid, heartbeat.memory, now)
                {
                    self.status.set_blocked(heartbeat.pid, false);
                }
                self.status.apply(message);
                BusReply::Ack
            }
            BusMessage::Detached(detached) => {
                self.supervisor.on_detached(detached.pid);
                self.status.apply(message);
                BusReply::Ack
            }
            BusMessage::ProcessExiting(exiting) => {
                self.supervisor.on_exiting(exiting.pid, exiting.exit_code);
                BusReply::Ack
            }
            BusMessage::ProcessSpawned(spawned) => {
                // The child may already have been reaped.
                if self.supervisor.pool().process(spawned.pid).is_some() {
                    self.status.apply(message);
                } else {
                    debug!(pid = spawned.pid, "ignoring announcement of an untracked worker");
                }
                BusReply::Ack
            }
            BusMessage::RxIncrement(_)
            | BusMessage::TxIncrement(_)
            | BusMessage::RequestIncrement(_)
            | BusMessage::ConnectionOpened(_)
            | BusMessage::ConnectionClosed(_) => {
                self.status.apply(message);
                BusReply::Ack
            }
            BusMessage::StopServer(stop) => {
                self.shutdown(stop.code);
                BusReply::Ack
            }
            BusMessage::ReloadServer(_) => {
                self.reload();
                BusReply::Ack
            }
            BusMessage::GetServerStatus(_) => BusReply::Status(Box::new(self.snapshot())),
            BusMessage::GetConnections(_) => BusReply::Connections(self.status.connections()),
            BusMessage::GetSchedulerStatus(_) => BusReply::Scheduler(self.scheduler.tasks_info()),
        }
    }

    fn answer_relay(&mut self, request: RelayRequest) -> RelayResponse {
        match request {
            RelayRequest::Status => RelayResponse::Status(Box::new(self.snapshot())),
            RelayRequest::Connections => RelayResponse::Connections(self.status.connections()),
            RelayRequest::Scheduler => RelayResponse::Scheduler(self.scheduler.tasks_info()),
        }
    }

    fn snapshot(&mut self) -> ServerStatusSnapshot {
        self.status.set_periodic(self.scheduler.tasks_info());
        self.status.snapshot()
    }

    fn on_tick(&mut self) {
        let now = Instant::now().into_std();
        if self.shutdown.is_some() {
            self.supervisor.sweep(now);
            self.scheduler.sweep(now);
            return;
        }
        self.supervisor.due_respawns(now);
        for change in self.supervisor.check_blocked(now) {
            self.status.set_blocked(change.pid, change.blocked);
        }
        self.scheduler.tick(Utc::now());
    }

    fn reload(&mut self) {
        if self.shutdown.is_some() {
            return;
        }
        self.supervisor.reload();
    }

    /// Begin shutdown; later calls are ignored.
    fn shutdown(&mut self, code: i32) {
        if self.shutdown.is_some() {
            return;
        }
        info!(code, "shutting down");
        self.exit_code = code;
        let now = Instant::now();
        self.supervisor.stop(now.into_std());
        self.scheduler.stop(now.into_std());
        self.status.set_stopped();

        let pending: Vec<_> = self.modules.iter_mut().filter_map(|m| m.stop()).collect();
        let modules_pending = !pending.is_empty();
        if modules_pending {
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                futures_util::future::join_all(pending).await;
                let _ = events.send(LoopEvent::ModulesStopped);
            });
        }

        self.shutdown = Some(Shutdown {
            deadline: self.options.shutdown_timeout.map(|timeout| now + timeout),
            modules_pending,
        });
    }

    fn shutdown_complete(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|s| !s.modules_pending)
            && self.supervisor.is_stopped()
            && self.scheduler.is_stopped()
    }

    fn cleanup(&self) {
        for path in self.options.paths.owned_files() {
            if path.exists() {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), %err, "cannot remove run-time file");
                }
            }
        }
    }
}
