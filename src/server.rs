//! Embedding API: declare workers, periodic tasks and modules, then run.
//!
//! The same [`Server`] value is built in the master and in every child.
//! [`Server::run`] looks at the role marker in the environment and either
//! runs the master or the one template the child was started for.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::bus::{BusClient, SOCKET_ENV};
use crate::config::ServerConfig;
use crate::master::launcher::{daemonize, Daemonized, ExecLauncher};
use crate::master::module::Module;
use crate::master::paths::RunPaths;
use crate::master::{MasterOptions, MasterProcess};
use crate::models::{
    ChildRole, IdAllocator, PeriodicSpec, PeriodicTemplate, ProcessBody, RoleKind, TemplateId,
    WorkerSpec, WorkerTemplate,
};
use crate::runtime::external::ExternalCommand;
use crate::runtime::lifecycle::LifecycleHandler;
use crate::runtime::privileges::{current_user_name, switch_identity};
use crate::runtime::trigger::ReloadStrategy;
use crate::runtime::{ProcessRuntime, RuntimeMode, RuntimeOptions};
use crate::supervisor::signal::NixSignaller;
use crate::{AppError, Result};

/// A configured server, ready to run as master or child.
pub struct Server {
    config: ServerConfig,
    ids: IdAllocator,
    workers: Vec<WorkerTemplate>,
    periodic: Vec<PeriodicTemplate>,
    modules: Vec<Box<dyn Module>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Server {
    /// Empty server with the given settings; `workers` and `periodic`
    /// entries of the configuration are not added.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            ids: IdAllocator::new(),
            workers: Vec::new(),
            periodic: Vec::new(),
            modules: Vec::new(),
        }
    }

    /// Server with every worker and periodic task of `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a command line is invalid or a
    /// name is duplicated.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let workers = config.workers.clone();
        let periodic = config.periodic.clone();
        let mut server = Self::new(config);

        for worker in workers {
            let mut spec = WorkerSpec::new(worker.name)
                .count(worker.count)
                .reloadable(worker.reloadable)
                .external(ExternalCommand::parse(&worker.command)?);
            if let Some(user) = worker.user {
                spec = spec.user(user);
            }
            if let Some(group) = worker.group {
                spec = spec.group(group);
            }
            for strategy in worker.reload_strategies {
                spec = spec.reload_strategy(strategy);
            }
            server.add_worker(spec)?;
        }

        for task in periodic {
            let mut spec = PeriodicSpec::new(task.name, task.schedule)
                .external(ExternalCommand::parse(&task.command)?);
            if let Some(user) = task.user {
                spec = spec.user(user);
            }
            if let Some(group) = task.group {
                spec = spec.group(group);
            }
            server.add_periodic(spec)?;
        }

        Ok(server)
    }

    /// Settings in force.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Add a worker template.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on an empty or duplicate name or a zero
    /// replica count.
    pub fn add_worker(&mut self, spec: WorkerSpec) -> Result<TemplateId> {
        let template = WorkerTemplate::from_spec(spec, &mut self.ids)?;
        self.ensure_unique(&template.name)?;
        let id = template.id;
        self.workers.push(template);
        Ok(id)
    }

    /// Add a periodic task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on an empty or duplicate name.
    pub fn add_periodic(&mut self, spec: PeriodicSpec) -> Result<TemplateId> {
        let template = PeriodicTemplate::from_spec(spec, &mut self.ids)?;
        self.ensure_unique(&template.name)?;
        let id = template.id;
        self.periodic.push(template);
        Ok(id)
    }

    /// Add a master-side module.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a module with the same name exists.
    pub fn add_module(&mut self, module: impl Module + 'static) -> Result<()> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(AppError::Config(format!(
                "module '{}' is registered twice",
                module.name()
            )));
        }
        self.modules.push(Box::new(module));
        Ok(())
    }

    /// Worker templates in registration order.
    #[must_use]
    pub fn workers(&self) -> &[WorkerTemplate] {
        &self.workers
    }

    /// Periodic templates in registration order.
    #[must_use]
    pub fn periodic(&self) -> &[PeriodicTemplate] {
        &self.periodic
    }

    /// Run file locations for this server's executable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the executable path is unavailable.
    pub fn run_paths(&self) -> Result<RunPaths> {
        RunPaths::for_current_exe(self.config.pid_file.as_deref())
    }

    /// Run as master, or as the child named by the role marker.
    ///
    /// Blocks until the process should exit and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented the master or child from running.
    pub fn run(self, daemon: bool) -> Result<i32> {
        if let Some(role) = ChildRole::from_env()? {
            let runtime = current_thread_runtime()?;
            return runtime.block_on(self.run_child(role));
        }

        if daemon {
            if let Daemonized::Parent(pid) = daemonize()? {
                info!(pid, "master daemonized");
                return Ok(0);
            }
        }

        let options = MasterOptions {
            paths: self.run_paths()?,
            supervisor: self.config.supervisor_options(),
            shutdown_timeout: self.config.shutdown_timeout(),
        };
        let master = MasterProcess::new(
            options,
            self.workers,
            self.periodic,
            self.modules,
            Box::new(ExecLauncher::current()?),
            Arc::new(NixSignaller),
        )?;
        let runtime = current_thread_runtime()?;
        runtime.block_on(master.run())
    }

    async fn run_child(self, role: ChildRole) -> Result<i32> {
        let socket = std::env::var_os(SOCKET_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| AppError::Supervision(format!("{SOCKET_ENV} is not set")))?;
        let heartbeat_period = self.config.heartbeat_period();

        let child = match role.kind {
            RoleKind::Worker => self
                .workers
                .into_iter()
                .find(|t| t.id == role.id)
                .map(|t| ChildTemplate::worker(t, heartbeat_period)),
            RoleKind::Periodic => self
                .periodic
                .into_iter()
                .find(|t| t.id == role.id)
                .map(|t| ChildTemplate::periodic(t, heartbeat_period)),
        }
        .ok_or_else(|| AppError::Supervision(format!("no template for {role}")))?;

        if let Err(err) = switch_identity(child.user.as_deref(), child.group.as_deref()) {
            warn!(%err, "running with the master's identity");
        }
        let mut options = child.options;
        options.user = current_user_name();

        let bus = BusClient::connect(&socket).await?;
        let mut runtime = ProcessRuntime::new(options, child.handlers, child.strategies, bus);
        let code = runtime.run().await?;

        if runtime.handed_off() {
            if let Some(command) = child.external {
                let err = command.exec();
                error!(%err, "external program did not start");
                return Ok(1);
            }
        }
        Ok(code)
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        let taken = self.workers.iter().any(|t| t.name == name)
            || self.periodic.iter().any(|t| t.name == name);
        if taken {
            return Err(AppError::Config(format!(
                "process name '{name}' is already registered"
            )));
        }
        Ok(())
    }
}

/// Everything a child needs from its template.
struct ChildTemplate {
    options: RuntimeOptions,
    user: Option<String>,
    group: Option<String>,
    handlers: Vec<Arc<dyn LifecycleHandler>>,
    strategies: Vec<Box<dyn ReloadStrategy>>,
    external: Option<ExternalCommand>,
}

impl ChildTemplate {
    fn worker(template: WorkerTemplate, heartbeat_period: Duration) -> Self {
        let strategies = template
            .reload_strategies
            .iter()
            .map(|config| config.build())
            .collect();
        let (handlers, external, mode) = split_body(template.body, RuntimeMode::Resident);
        Self {
            options: RuntimeOptions {
                template_id: template.id,
                kind: RoleKind::Worker,
                name: template.name,
                user: String::new(),
                reloadable: template.reloadable,
                heartbeat_period,
                mode,
            },
            user: template.user,
            group: template.group,
            handlers,
            strategies,
            external,
        }
    }

    fn periodic(template: PeriodicTemplate, heartbeat_period: Duration) -> Self {
        let (handlers, external, mode) = split_body(template.body, RuntimeMode::OneShot);
        Self {
            options: RuntimeOptions {
                template_id: template.id,
                kind: RoleKind::Periodic,
                name: template.name,
                user: String::new(),
                reloadable: false,
                heartbeat_period,
                mode,
            },
            user: template.user,
            group: template.group,
            handlers,
            strategies: Vec::new(),
            external,
        }
    }
}

fn split_body(
    body: ProcessBody,
    mode: RuntimeMode,
) -> (Vec<Arc<dyn LifecycleHandler>>, Option<ExternalCommand>, RuntimeMode) {
    match body {
        ProcessBody::Handlers(handlers) => (handlers, None, mode),
        ProcessBody::External(command) => (Vec::new(), Some(command), RuntimeMode::Handoff),
    }
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Supervision(format!("cannot build runtime: {err}")))
}
