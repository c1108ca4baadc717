//! Child-side process runtime.
//!
//! A [`ProcessRuntime`] drives one worker replica or periodic run through
//! `Shutdown → Starting → Running → Stopping`. It announces itself to the
//! master over the bus, dispatches lifecycle events to the template's
//! handlers, sends heartbeats, and turns `SIGTERM`/`SIGUSR1` into stop and
//! reload. `SIGINT` is ignored: the master owns interrupt handling for
//! the whole process group.

pub mod external;
pub mod lifecycle;
pub mod memory;
pub mod privileges;
pub mod trigger;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::message::{Composite, Detached, Heartbeat, ProcessExiting, ProcessSpawned};
use crate::bus::BusClient;
use crate::models::{RoleKind, TemplateId};
use crate::{AppError, Result};

use lifecycle::{LifecycleEvent, LifecycleHandler, ProcessContext};
use memory::MemoryProbe;
use trigger::{ReloadStrategy, ReloadStrategyTrigger, RuntimeEvent};

/// Exit code a child returns to ask the master for an immediate replacement.
pub const RELOAD_EXIT_CODE: i32 = 100;

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the bus to flush while stopping.
const BUS_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Not started, or finished.
    Shutdown,
    /// Start announcement in flight.
    Starting,
    /// Start handlers done.
    Running,
    /// Stop requested; the loop exits once start has settled.
    Stopping,
}

/// What the runtime does after its `Start` handlers return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Keep running until stopped.
    Resident,
    /// Stop with code 0: a periodic run.
    OneShot,
    /// Detach and stop with code 0 so the caller can exec an external
    /// program.
    Handoff,
}

/// Commands accepted by a running runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCommand {
    /// Stop with the given exit code.
    Stop(i32),
    /// Exit for replacement.
    Reload,
    /// Offer an event to the reload trigger.
    Emit(RuntimeEvent),
    /// Relinquish supervision.
    Detach,
}

/// Cloneable sender of [`RuntimeCommand`]s.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<RuntimeCommand>,
}

impl RuntimeHandle {
    /// Create a handle and the receiver a runtime drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RuntimeCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, command: RuntimeCommand) {
        if self.tx.send(command).is_err() {
            debug!("runtime already finished; command dropped");
        }
    }

    /// Request a stop.
    pub fn stop(&self, code: i32) {
        self.send(RuntimeCommand::Stop(code));
    }

    /// Request a reload.
    pub fn reload(&self) {
        self.send(RuntimeCommand::Reload);
    }

    /// Report an event to the reload trigger.
    pub fn emit(&self, event: RuntimeEvent) {
        self.send(RuntimeCommand::Emit(event));
    }

    /// Request detachment from supervision.
    pub fn detach(&self) {
        self.send(RuntimeCommand::Detach);
    }
}

/// Static description of the child a runtime drives.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Template id.
    pub template_id: TemplateId,
    /// Worker or periodic.
    pub kind: RoleKind,
    /// Template name.
    pub name: String,
    /// Effective OS user reported to the master.
    pub user: String,
    /// Whether reload requests are honoured.
    pub reloadable: bool,
    /// Heartbeat interval.
    pub heartbeat_period: Duration,
    /// Behaviour after start.
    pub mode: RuntimeMode,
}

/// Event loop of one child process.
pub struct ProcessRuntime {
    options: RuntimeOptions,
    state: RuntimeState,
    exit_code: i32,
    pid: u32,
    detached: bool,
    handed_off: bool,
    handlers: Vec<Arc<dyn LifecycleHandler>>,
    trigger: ReloadStrategyTrigger,
    bus: BusClient,
    handle: RuntimeHandle,
    commands: mpsc::UnboundedReceiver<RuntimeCommand>,
    started: Instant,
    memory: MemoryProbe,
}

impl ProcessRuntime {
    /// Build a runtime; nothing happens until [`Self::run`].
    #[must_use]
    pub fn new(
        options: RuntimeOptions,
        handlers: Vec<Arc<dyn LifecycleHandler>>,
        strategies: Vec<Box<dyn ReloadStrategy>>,
        bus: BusClient,
    ) -> Self {
        let (handle, commands) = RuntimeHandle::channel();
        let trigger = ReloadStrategyTrigger::new(handle.clone(), strategies);
        Self {
            options,
            state: RuntimeState::Shutdown,
            exit_code: 0,
            pid: std::process::id(),
            detached: false,
            handed_off: false,
            handlers,
            trigger,
            bus,
            handle,
            commands,
            started: Instant::now(),
            memory: MemoryProbe::current(),
        }
    }

    /// Handle for stopping or reloading this runtime from elsewhere.
    #[must_use]
    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// Exit code the runtime will return.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Whether a [`RuntimeMode::Handoff`] run completed its start and the
    /// caller should now exec the external program.
    #[must_use]
    pub fn handed_off(&self) -> bool {
        self.handed_off
    }

    /// Run until stopped and return the exit code.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Supervision` when the runtime is not in
    /// [`RuntimeState::Shutdown`], and `AppError::Io` when signal handlers
    /// cannot be installed.
    pub async fn run(&mut self) -> Result<i32> {
        if self.state != RuntimeState::Shutdown {
            return Err(AppError::Supervision(format!(
                "runtime cannot start from state {:?}",
                self.state
            )));
        }
        self.state = RuntimeState::Starting;
        self.started = Instant::now();

        let mut terminate = signal(SignalKind::terminate())?;
        let mut user1 = signal(SignalKind::user_defined1())?;
        let mut interrupt = signal(SignalKind::interrupt())?;

        let period = self.options.heartbeat_period;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let ctx = ProcessContext::new(
            self.pid,
            self.options.template_id,
            self.options.name.clone(),
            self.handle.clone(),
            self.bus.clone(),
        );

        let announce = Composite {
            messages: vec![self.spawned_message().into(), self.heartbeat_message().into()],
        };
        let mut start = self.bus.dispatch(announce);
        let mut start_settled = false;

        info!(
            pid = self.pid,
            template = %self.options.template_id,
            name = %self.options.name,
            "process starting"
        );

        loop {
            tokio::select! {
                result = &mut start, if !start_settled => {
                    start_settled = true;
                    if let Err(err) = result {
                        warn!(%err, "start announcement not acknowledged");
                    }
                    self.on_started(&ctx);
                }
                _ = heartbeat.tick(), if start_settled && !self.detached => {
                    self.send_heartbeat();
                }
                _ = terminate.recv() => {
                    self.stop(0);
                }
                _ = user1.recv() => {
                    self.reload();
                }
                _ = interrupt.recv() => debug!("interrupt ignored by child"),
                Some(command) = self.commands.recv() => self.apply(command),
            }

            if start_settled && self.state == RuntimeState::Stopping {
                break;
            }
        }

        self.finish(&ctx).await;
        Ok(self.exit_code)
    }

    /// Move to `Stopping` with `code`.
    ///
    /// Only acts from `Starting` or `Running`; returns whether it did.
    pub fn stop(&mut self, code: i32) -> bool {
        if !matches!(self.state, RuntimeState::Starting | RuntimeState::Running) {
            return false;
        }
        debug!(code, "stop requested");
        self.exit_code = code;
        self.state = RuntimeState::Stopping;
        true
    }

    /// Stop with [`RELOAD_EXIT_CODE`] when the template is reloadable.
    ///
    /// Returns whether a reload was started.
    pub fn reload(&mut self) -> bool {
        if !self.options.reloadable {
            debug!("reload ignored: template is not reloadable");
            return false;
        }
        self.stop(RELOAD_EXIT_CODE)
    }

    fn apply(&mut self, command: RuntimeCommand) {
        match command {
            RuntimeCommand::Stop(code) => {
                self.stop(code);
            }
            RuntimeCommand::Reload => {
                self.reload();
            }
            RuntimeCommand::Emit(event) => {
                self.trigger.emit_event(&event);
            }
            RuntimeCommand::Detach => self.detach(),
        }
    }

    fn on_started(&mut self, ctx: &ProcessContext) {
        if self.state == RuntimeState::Stopping {
            return;
        }
        self.dispatch(LifecycleEvent::Start, ctx);
        if self.state == RuntimeState::Starting {
            self.state = RuntimeState::Running;
        }
        match self.options.mode {
            RuntimeMode::Resident => {}
            RuntimeMode::OneShot => {
                self.stop(0);
            }
            RuntimeMode::Handoff => {
                self.detach();
                self.handed_off = self.stop(0);
            }
        }
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        drop(self.bus.dispatch(Detached { pid: self.pid }));
        info!(pid = self.pid, "process detached from supervision");
    }

    fn send_heartbeat(&mut self) {
        let message = self.heartbeat_message();
        let event = RuntimeEvent::Heartbeat {
            memory: message.memory,
            uptime: self.started.elapsed(),
        };
        drop(self.bus.dispatch(message));
        self.trigger.emit_event(&event);
    }

    async fn finish(&mut self, ctx: &ProcessContext) {
        let exiting = self.bus.dispatch(ProcessExiting {
            pid: self.pid,
            exit_code: self.exit_code,
        });
        if let Err(err) = exiting.await {
            debug!(%err, "exit notice not acknowledged");
        }

        let event = if self.exit_code == RELOAD_EXIT_CODE {
            LifecycleEvent::Reload
        } else {
            LifecycleEvent::Stop
        };
        self.dispatch(event, ctx);

        // Flush after the hooks so their final reports are acknowledged.
        if let Err(err) = self.bus.stop(BUS_FLUSH_TIMEOUT).await {
            warn!(%err, "bus did not flush before exit");
        }
        self.state = RuntimeState::Shutdown;
        info!(pid = self.pid, code = self.exit_code, "process stopped");
    }

    fn dispatch(&mut self, event: LifecycleEvent, ctx: &ProcessContext) {
        for handler in &self.handlers {
            if let Err(err) = handler.handle(event, ctx) {
                error!(%err, ?event, "lifecycle handler failed");
                self.trigger.emit_event(&RuntimeEvent::HookFailed {
                    message: err.to_string(),
                });
            }
        }
    }

    fn spawned_message(&self) -> ProcessSpawned {
        ProcessSpawned {
            template_id: self.options.template_id,
            kind: self.options.kind,
            pid: self.pid,
            user: self.options.user.clone(),
            name: self.options.name.clone(),
            reloadable: self.options.reloadable,
            started_at: Utc::now(),
        }
    }

    fn heartbeat_message(&mut self) -> Heartbeat {
        let elapsed = self.started.elapsed();
        Heartbeat {
            pid: self.pid,
            memory: self.memory.resident_bytes(),
            time_ns: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}
