//! Worker and periodic templates, id allocation and child roles.

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::runtime::external::ExternalCommand;
use crate::runtime::lifecycle::LifecycleHandler;
use crate::runtime::trigger::ReloadStrategyConfig;
use crate::{AppError, Result};

/// Environment variable carrying the role of a re-executed child.
pub const ROLE_ENV: &str = "PROCHIVE_ROLE";

/// Identifier assigned to a template by the configuration stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub u32);

impl Display for TemplateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out template ids in registration order.
///
/// Master and children rebuild the same configuration, so the same
/// registration order yields the same ids on both sides.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    /// Create an allocator starting at id 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn allocate(&mut self) -> TemplateId {
        self.next += 1;
        TemplateId(self.next)
    }
}

/// What a child process executes once started.
#[derive(Clone)]
pub enum ProcessBody {
    /// In-process lifecycle handlers, dispatched in registration order.
    Handlers(Vec<Arc<dyn LifecycleHandler>>),
    /// An external program that replaces the child's process image.
    External(ExternalCommand),
}

impl Debug for ProcessBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handlers(handlers) => write!(f, "Handlers({})", handlers.len()),
            Self::External(command) => write!(f, "External({})", command.raw()),
        }
    }
}

impl Default for ProcessBody {
    fn default() -> Self {
        Self::Handlers(Vec::new())
    }
}

impl ProcessBody {
    fn push_handler(&mut self, handler: Arc<dyn LifecycleHandler>) {
        match self {
            Self::Handlers(handlers) => handlers.push(handler),
            Self::External(_) => *self = Self::Handlers(vec![handler]),
        }
    }
}

/// Worker definition before an id has been assigned.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    name: String,
    count: u32,
    reloadable: bool,
    user: Option<String>,
    group: Option<String>,
    body: ProcessBody,
    reload_strategies: Vec<ReloadStrategyConfig>,
}

impl WorkerSpec {
    /// Start a definition with one reloadable replica.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 1,
            reloadable: true,
            user: None,
            group: None,
            body: ProcessBody::default(),
            reload_strategies: Vec::new(),
        }
    }

    /// Desired number of replicas.
    #[must_use]
    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Whether replicas honour reload requests.
    #[must_use]
    pub fn reloadable(mut self, reloadable: bool) -> Self {
        self.reloadable = reloadable;
        self
    }

    /// Run replicas as this OS user.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Run replicas with this OS group.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Append a lifecycle handler.
    #[must_use]
    pub fn handler(mut self, handler: impl LifecycleHandler + 'static) -> Self {
        self.body.push_handler(Arc::new(handler));
        self
    }

    /// Replace the body with an external program.
    #[must_use]
    pub fn external(mut self, command: ExternalCommand) -> Self {
        self.body = ProcessBody::External(command);
        self
    }

    /// Append a reload strategy.
    #[must_use]
    pub fn reload_strategy(mut self, strategy: ReloadStrategyConfig) -> Self {
        self.reload_strategies.push(strategy);
        self
    }
}

/// Immutable worker template: one entry in the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerTemplate {
    /// Id assigned by the configuration stage.
    pub id: TemplateId,
    /// Display name.
    pub name: String,
    /// Desired replica count.
    pub count: u32,
    /// Whether replicas honour reload requests.
    pub reloadable: bool,
    /// Target OS user.
    pub user: Option<String>,
    /// Target OS group.
    pub group: Option<String>,
    /// What each replica runs.
    pub body: ProcessBody,
    /// Reload strategies evaluated inside each replica.
    pub reload_strategies: Vec<ReloadStrategyConfig>,
}

impl WorkerTemplate {
    /// Freeze a spec into a template, allocating its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the name is empty or the replica
    /// count is zero.
    pub fn from_spec(spec: WorkerSpec, ids: &mut IdAllocator) -> Result<Self> {
        if spec.name.trim().is_empty() {
            return Err(AppError::Config("worker name must not be empty".into()));
        }
        if spec.count == 0 {
            return Err(AppError::Config(format!(
                "worker '{}' must have at least one replica",
                spec.name
            )));
        }
        Ok(Self {
            id: ids.allocate(),
            name: spec.name,
            count: spec.count,
            reloadable: spec.reloadable,
            user: spec.user,
            group: spec.group,
            body: spec.body,
            reload_strategies: spec.reload_strategies,
        })
    }
}

/// Periodic task definition before an id has been assigned.
#[derive(Debug, Clone)]
pub struct PeriodicSpec {
    name: String,
    schedule: String,
    user: Option<String>,
    group: Option<String>,
    body: ProcessBody,
}

impl PeriodicSpec {
    /// Start a definition with a schedule expression.
    #[must_use]
    pub fn new(name: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            user: None,
            group: None,
            body: ProcessBody::default(),
        }
    }

    /// Run the task as this OS user.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Run the task with this OS group.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Append a lifecycle handler; the `Start` event is the task body.
    #[must_use]
    pub fn handler(mut self, handler: impl LifecycleHandler + 'static) -> Self {
        self.body.push_handler(Arc::new(handler));
        self
    }

    /// Replace the body with an external program.
    #[must_use]
    pub fn external(mut self, command: ExternalCommand) -> Self {
        self.body = ProcessBody::External(command);
        self
    }
}

/// Immutable periodic task template.
#[derive(Debug, Clone)]
pub struct PeriodicTemplate {
    /// Id assigned by the configuration stage.
    pub id: TemplateId,
    /// Display name.
    pub name: String,
    /// Raw schedule expression as configured.
    pub schedule: String,
    /// Target OS user.
    pub user: Option<String>,
    /// Target OS group.
    pub group: Option<String>,
    /// What each run executes.
    pub body: ProcessBody,
}

impl PeriodicTemplate {
    /// Freeze a spec into a template, allocating its id.
    ///
    /// An unparsable schedule is accepted here; the scheduler lists the
    /// task but never triggers it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the name is empty.
    pub fn from_spec(spec: PeriodicSpec, ids: &mut IdAllocator) -> Result<Self> {
        if spec.name.trim().is_empty() {
            return Err(AppError::Config("periodic task name must not be empty".into()));
        }
        Ok(Self {
            id: ids.allocate(),
            name: spec.name,
            schedule: spec.schedule,
            user: spec.user,
            group: spec.group,
            body: spec.body,
        })
    }
}

/// Closed set of process variants the master knows how to start.
#[derive(Debug, Clone)]
pub enum ProcessKind {
    /// One replica of a worker template.
    Worker(Arc<WorkerTemplate>),
    /// One run of a periodic task.
    Periodic(Arc<PeriodicTemplate>),
}

impl ProcessKind {
    /// Template id of the variant.
    #[must_use]
    pub fn id(&self) -> TemplateId {
        match self {
            Self::Worker(t) => t.id,
            Self::Periodic(t) => t.id,
        }
    }

    /// Template name of the variant.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Worker(t) => &t.name,
            Self::Periodic(t) => &t.name,
        }
    }

    /// Role marker handed to the re-executed child.
    #[must_use]
    pub fn role(&self) -> ChildRole {
        match self {
            Self::Worker(t) => ChildRole {
                kind: RoleKind::Worker,
                id: t.id,
            },
            Self::Periodic(t) => ChildRole {
                kind: RoleKind::Periodic,
                id: t.id,
            },
        }
    }
}

/// Why a spawn was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnReason {
    /// Initial replica at startup.
    Initial,
    /// Replacement after a reload exit.
    Reload,
    /// Replacement after a crash exit.
    Crash,
    /// Periodic task came due.
    Schedule,
}

/// A decision that a new OS process is needed; executed by the master loop.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// What to start.
    pub kind: ProcessKind,
    /// Why it is being started.
    pub reason: SpawnReason,
}

/// Kind component of a child role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    /// Worker replica.
    Worker,
    /// Periodic task run.
    Periodic,
}

/// Role marker passed from master to child via [`ROLE_ENV`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRole {
    /// Variant.
    pub kind: RoleKind,
    /// Template id.
    pub id: TemplateId,
}

impl ChildRole {
    /// Read the role of the current process, if it is a child.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Supervision` when the marker is present but
    /// malformed.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(ROLE_ENV) {
            Ok(raw) if !raw.is_empty() => raw.parse().map(Some),
            _ => Ok(None),
        }
    }
}

impl Display for ChildRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            RoleKind::Worker => "worker",
            RoleKind::Periodic => "periodic",
        };
        write!(f, "{kind}:{}", self.id)
    }
}

impl FromStr for ChildRole {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || AppError::Supervision(format!("invalid child role marker '{raw}'"));
        let (kind, id) = raw.split_once(':').ok_or_else(invalid)?;
        let kind = match kind {
            "worker" => RoleKind::Worker,
            "periodic" => RoleKind::Periodic,
            _ => return Err(invalid()),
        };
        let id = id.parse::<u32>().map_err(|_| invalid())?;
        Ok(Self {
            kind,
            id: TemplateId(id),
        })
    }
}
