use alloc::boxed::Box;

/// Queue a unit of work is scheduled on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Runs before any timed work, in FIFO order.
    Immediate,
    /// Runs once the logical clock reaches its due time.
    Timed,
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Tier::Immediate => write!(f, "immediate"),
            Tier::Timed => write!(f, "timed"),
        }
    }
}

/// Opaque zero-argument unit of work. The scheduler owns it from enqueue until it runs.
pub struct Task {
    job: Box<dyn FnOnce()>,
}

impl Task {
    pub fn new(job: impl FnOnce() + 'static) -> Self {
        Self { job: Box::new(job) }
    }

    pub(crate) fn run(self) {
        (self.job)()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}
