use sysinfo::{Pid, System};

use crate::errors::{RecoveryError, Result};

/// Live process lookups used by the watcher loop and the pre-repair
/// guard. A trait seam so the loop logic can be driven in tests.
pub trait ProcessInspector {
    fn is_running(&mut self, process_name: &str) -> bool;
    fn pid_alive(&mut self, pid: u32) -> bool;
}

pub struct SystemInspector {
    system: System,
}

impl SystemInspector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }
}

impl Default for SystemInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SystemInspector {
    fn is_running(&mut self, process_name: &str) -> bool {
        self.system.refresh_processes();
        self.system
            .processes()
            .values()
            .any(|process| process.name().eq_ignore_ascii_case(process_name))
    }

    fn pid_alive(&mut self, pid: u32) -> bool {
        self.system.refresh_processes();
        self.system.process(Pid::from_u32(pid)).is_some()
    }
}

/// The patch target must not be running while its binaries get replaced.
pub fn ensure_target_idle(
    inspector: &mut dyn ProcessInspector,
    process_name: &str,
) -> Result<()> {
    if inspector.is_running(process_name) {
        return Err(RecoveryError::Process(format!(
            "{} is still running, close it before repairing",
            process_name
        )));
    }
    Ok(())
}
