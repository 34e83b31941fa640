//! Process identity seam used for fork-safety checks.

/// Reports the id of the process the caller is running in.
pub trait ProcessIdentity: Send + Sync {
    fn current_pid(&self) -> u32;
}

/// The real OS process id.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcess;

impl ProcessIdentity for OsProcess {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// A fixed id, used to stand in for a parent or a forked child in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPid(pub u32);

impl ProcessIdentity for FixedPid {
    fn current_pid(&self) -> u32 {
        self.0
    }
}
