//! Graceful-stop deadlines with a single `SIGKILL` escalation.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::signal::{ChildSignal, ProcessSignaller};

/// Tracks children that were asked to stop.
#[derive(Debug)]
pub struct StopTracker {
    timeout: Duration,
    deadlines: HashMap<u32, Instant>,
    killed: HashSet<u32>,
}

impl StopTracker {
    /// Tracker allowing each child `timeout` before it is killed.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadlines: HashMap::new(),
            killed: HashSet::new(),
        }
    }

    /// Send `SIGTERM` to every pid and start its deadline.
    pub fn terminate_all(
        &mut self,
        pids: impl IntoIterator<Item = u32>,
        now: Instant,
        signaller: &dyn ProcessSignaller,
    ) {
        for pid in pids {
            if let Err(err) = signaller.send(pid, ChildSignal::Terminate) {
                debug!(pid, %err, "terminate signal not delivered");
            }
            self.deadlines.entry(pid).or_insert(now + self.timeout);
        }
    }

    /// Send `SIGKILL` once to every pid past its deadline.
    ///
    /// Returns the pids killed by this call.
    pub fn sweep(&mut self, now: Instant, signaller: &dyn ProcessSignaller) -> Vec<u32> {
        let overdue: Vec<u32> = self
            .deadlines
            .iter()
            .filter(|(pid, deadline)| **deadline <= now && !self.killed.contains(*pid))
            .map(|(pid, _)| *pid)
            .collect();

        for pid in &overdue {
            warn!(pid, "child ignored stop request; killing");
            if let Err(err) = signaller.send(*pid, ChildSignal::Kill) {
                debug!(pid, %err, "kill signal not delivered");
            }
            self.killed.insert(*pid);
        }
        overdue
    }

    /// Drop the deadline of an exited child.
    pub fn forget(&mut self, pid: u32) {
        self.deadlines.remove(&pid);
        self.killed.remove(&pid);
    }

    /// Whether any child is still awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
