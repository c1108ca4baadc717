//! Resident memory sampling for heartbeats.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Samples the resident memory of the current process.
pub struct MemoryProbe {
    system: System,
    pid: Pid,
}

impl MemoryProbe {
    /// Probe for the calling process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Resident set size in bytes; 0 when the process cannot be read.
    pub fn resident_bytes(&mut self) -> u64 {
        let pids = [self.pid];
        let _ = self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(self.pid).map_or(0, sysinfo::Process::memory)
    }
}
