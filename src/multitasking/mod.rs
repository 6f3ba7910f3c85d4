use core::fmt;

pub mod process;
pub mod program;
pub mod queues;
pub mod scheduler;
pub mod spawner;
pub mod table;

pub use process::{Process, Status};
pub use scheduler::{Policy, Scheduler, SchedulerConfig};
pub use spawner::{Spawner, SpawnerConfig};
pub use table::{ProcessHandle, ProcessTable};

/// Opaque process handle. Queues and the finished list pass these around;
/// the process table maps them back to the processes it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const fn first() -> Self {
        Pid(1)
    }

    /// Only to be used by the process table.
    pub fn next(self) -> Self {
        assert_ne!(self.0, u32::MAX, "process id has no successor");
        Pid(self.0 + 1)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // delegate so width/fill specifiers apply (`{:02}` in spawner names)
        fmt::Display::fmt(&self.0, f)
    }
}
