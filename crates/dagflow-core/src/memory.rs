//! Resident-set-size probing used to throttle source admission under
//! memory pressure.

use sysinfo::{Pid, System};

/// Samples this process's resident set size, in bytes.
pub struct MemoryProbe {
    system: System,
    pid: Pid,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().expect("failed to resolve current process id");
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Current RSS in bytes. Refreshes only this process, not the whole
    /// system table, to keep this cheap enough to call every admission pass.
    pub fn rss_bytes(&mut self) -> u64 {
        self.system.refresh_process(self.pid);
        self.system
            .process(self.pid)
            .map(|p| p.memory())
            .unwrap_or(0)
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}
