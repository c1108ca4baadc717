//! Extension points that live inside the master process.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::debug;

use crate::Result;

/// Work a module still has to finish before the master exits.
pub type StopFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Control requests a module can send to the master loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterCommand {
    /// Shut down with the exit code.
    Stop(i32),
    /// Reload reloadable workers.
    Reload,
}

/// Handle given to modules for controlling the master.
#[derive(Debug, Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<MasterCommand>,
}

impl MasterHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<MasterCommand>) -> Self {
        Self { tx }
    }

    /// Ask the master to shut down.
    pub fn stop(&self, code: i32) {
        self.send(MasterCommand::Stop(code));
    }

    /// Ask the master to reload its workers.
    pub fn reload(&self) {
        self.send(MasterCommand::Reload);
    }

    fn send(&self, command: MasterCommand) {
        if self.tx.send(command).is_err() {
            debug!(?command, "master loop gone; command dropped");
        }
    }
}

/// A component started and stopped with the master.
///
/// `init` runs inside the master's runtime after the bus and relay are up
/// and before any child is spawned, so a module may spawn tasks there.
pub trait Module: Send {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Start the module.
    ///
    /// # Errors
    ///
    /// Any error aborts master startup.
    fn init(&mut self, master: MasterHandle) -> Result<()>;

    /// Begin stopping; a returned future is awaited before the master exits.
    fn stop(&mut self) -> Option<StopFuture> {
        None
    }
}
