#![forbid(unsafe_code)]

//! Single-host multi-process supervisor.
//!
//! A master process keeps replicas of worker templates alive, runs
//! periodic tasks on a schedule, reloads workers gracefully and answers
//! status queries. Children report to the master over a local message
//! bus; control clients query it over a FIFO relay.

#[cfg(not(target_os = "linux"))]
compile_error!("prochive supports Linux only");

pub mod bus;
pub mod config;
pub mod errors;
pub mod master;
pub mod models;
pub mod relay;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod supervisor;

pub use config::ServerConfig;
pub use errors::{AppError, Result};
pub use master::module::{MasterHandle, Module, StopFuture};
pub use models::{PeriodicSpec, WorkerSpec};
pub use runtime::external::ExternalCommand;
pub use runtime::lifecycle::{LifecycleEvent, LifecycleHandler, ProcessContext};
pub use server::Server;
