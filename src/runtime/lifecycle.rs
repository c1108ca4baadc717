//! Lifecycle events, handlers and the context passed to them.

use chrono::Utc;

use super::trigger::RuntimeEvent;
use super::RuntimeHandle;
use crate::bus::message::{
    ConnectionClosed, ConnectionOpened, RequestIncrement, RxIncrement, TxIncrement,
};
use crate::bus::BusClient;
use crate::models::{Connection, TemplateId};
use crate::Result;

/// Points in a child's life at which handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The master has acknowledged the child; the body starts here.
    Start,
    /// The child is exiting.
    Stop,
    /// The child is exiting to be replaced.
    Reload,
}

/// User code attached to a worker or periodic template.
///
/// Handlers run on the child's event loop and must not block it for
/// long; spawn a task for ongoing work. An error is logged and reported
/// to the reload trigger; it never aborts the child.
pub trait LifecycleHandler: Send + Sync {
    /// React to a lifecycle event.
    ///
    /// # Errors
    ///
    /// Any error is treated as a handler failure.
    fn handle(&self, event: LifecycleEvent, ctx: &ProcessContext) -> Result<()>;
}

impl<F> LifecycleHandler for F
where
    F: Fn(LifecycleEvent, &ProcessContext) -> Result<()> + Send + Sync,
{
    fn handle(&self, event: LifecycleEvent, ctx: &ProcessContext) -> Result<()> {
        self(event, ctx)
    }
}

/// Identity of the running child plus handles to its runtime and bus.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pid: u32,
    template_id: TemplateId,
    name: String,
    runtime: RuntimeHandle,
    bus: BusClient,
}

impl ProcessContext {
    pub(crate) fn new(
        pid: u32,
        template_id: TemplateId,
        name: String,
        runtime: RuntimeHandle,
        bus: BusClient,
    ) -> Self {
        Self {
            pid,
            template_id,
            name,
            runtime,
            bus,
        }
    }

    /// OS pid of this child.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Template this child was started from.
    #[must_use]
    pub fn template_id(&self) -> TemplateId {
        self.template_id
    }

    /// Template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bus connection to the master.
    #[must_use]
    pub fn bus(&self) -> &BusClient {
        &self.bus
    }

    /// Handle to this child's runtime.
    #[must_use]
    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    /// Ask the runtime to stop with `code`.
    pub fn stop(&self, code: i32) {
        self.runtime.stop(code);
    }

    /// Ask the runtime to exit for replacement.
    pub fn reload(&self) {
        self.runtime.reload();
    }

    /// Report an event to the reload trigger.
    pub fn emit(&self, event: RuntimeEvent) {
        self.runtime.emit(event);
    }

    /// Relinquish supervision: the master stops tracking this child.
    pub fn detach(&self) {
        self.runtime.detach();
    }

    /// Report received bytes.
    pub fn report_rx(&self, bytes: u64) {
        drop(self.bus.dispatch(RxIncrement {
            pid: self.pid,
            bytes,
        }));
    }

    /// Report sent bytes.
    pub fn report_tx(&self, bytes: u64) {
        drop(self.bus.dispatch(TxIncrement {
            pid: self.pid,
            bytes,
        }));
    }

    /// Report one handled request; also feeds the reload trigger.
    pub fn report_request(&self) {
        drop(self.bus.dispatch(RequestIncrement {
            pid: self.pid,
            requests: 1,
        }));
        self.runtime.emit(RuntimeEvent::RequestHandled);
    }

    /// Report an accepted client connection.
    pub fn connection_opened(&self, id: u64, local_address: &str, remote_address: &str) {
        drop(self.bus.dispatch(ConnectionOpened {
            connection: Connection {
                pid: self.pid,
                id,
                local_address: local_address.to_owned(),
                remote_address: remote_address.to_owned(),
                opened_at: Utc::now(),
                rx: 0,
                tx: 0,
            },
        }));
    }

    /// Report a closed client connection.
    pub fn connection_closed(&self, id: u64) {
        drop(self.bus.dispatch(ConnectionClosed {
            pid: self.pid,
            connection_id: id,
        }));
    }
}
