//! Domain models for process templates and status reporting.
//!
//! Templates are immutable once the configuration stage has assigned
//! their ids; status models are plain serialisable records shared by the
//! master, the bus and the relay.

pub mod status;
pub mod template;

pub use status::{Connection, PeriodicInfo, ProcessInfo, ServerStatusSnapshot, WorkerInfo};
pub use template::{
    ChildRole, IdAllocator, PeriodicSpec, PeriodicTemplate, ProcessBody, ProcessKind, RoleKind,
    SpawnReason, SpawnRequest, TemplateId, WorkerSpec, WorkerTemplate,
};
