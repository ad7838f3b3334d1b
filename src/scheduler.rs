use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use core::fmt;
use core::future::Future;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::deferred::Deferred;
use crate::error::InvalidDelay;
use crate::report::{Reporter, TracingReporter};
use crate::runtime::{Core, PendingTasks, Ready};
use crate::task::{Task, Tier};
use crate::time::{Duration, Instant};

/// Single-threaded cooperative scheduler with an immediate (microtask) queue
/// and a timed (macrotask) queue driven by a logical millisecond clock.
///
/// The handle is cheap to clone; all clones drive the same queues.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<Core>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Appends `task` to the immediate queue.
    pub fn enqueue_immediate(&self, task: Task) {
        self.core.enqueue_immediate(task);
    }

    /// Schedules `task` to run once the logical clock reaches `now() + delay`.
    /// Tasks due at the same time run in the order they were enqueued.
    pub fn enqueue_timed(&self, task: Task, delay: Duration) -> Result<(), InvalidDelay> {
        self.core.enqueue_timed(task, delay).map(|_| ())
    }

    /// Runs until both queues are empty.
    ///
    /// Every pass drains the immediate queue completely, including entries
    /// enqueued during the drain, and only then takes the earliest timed task.
    pub fn run(&self) {
        let core = &self.core;
        let Some(running) = core.enter() else {
            warn!("scheduler is already running; nested run ignored");
            return;
        };
        debug!(now = %core.now(), "run loop started");

        let mut executed = 0_usize;
        loop {
            while let Some(ready) = core.pop_immediate() {
                core.execute(Tier::Immediate, ready);
                executed += 1;
            }
            match core.pop_timed() {
                Some(task) => {
                    core.execute(Tier::Timed, Ready::Run(task));
                    executed += 1;
                }
                None => break,
            }
        }

        drop(running);
        debug!(
            now = %core.now(),
            executed,
            suspended = core.pending().suspended,
            "run loop finished"
        );
    }

    /// Current logical time.
    pub fn now(&self) -> Instant {
        self.core.now()
    }

    pub fn pending(&self) -> PendingTasks {
        self.core.pending()
    }

    /// Starts an async computation and returns a deferred settled with its result.
    ///
    /// The computation runs synchronously up to its first suspension; every later
    /// step is resumed from the immediate queue.
    pub fn spawn<T, E, F>(&self, computation: F) -> Deferred<T, E>
    where
        T: Clone + 'static,
        E: Clone + fmt::Debug + 'static,
        F: Future<Output = Result<T, E>> + 'static,
    {
        let result = Deferred::pending(self);
        let target = result.clone();
        self.core.start_coroutine(
            async move {
                match computation.await {
                    Ok(value) => target.settle_ok(value),
                    Err(error) => target.settle_err(error),
                };
            }
            .boxed_local(),
        );
        result
    }

    pub(crate) fn downgrade(&self) -> Weak<Core> {
        Rc::downgrade(&self.core)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.core.now())
            .field("pending", &self.core.pending())
            .finish()
    }
}

/// Configures a [`Scheduler`].
pub struct SchedulerBuilder {
    start: Instant,
    reporter: Box<dyn Reporter>,
}

impl SchedulerBuilder {
    /// Initial value of the logical clock.
    pub fn start_at(mut self, start: Instant) -> Self {
        self.start = start;
        self
    }

    /// Sink for panics and unhandled rejections. Defaults to [`TracingReporter`].
    pub fn reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler {
            core: Rc::new(Core::new(self.start, self.reporter)),
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            start: Instant::ZERO,
            reporter: Box::new(TracingReporter),
        }
    }
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("start", &self.start)
            .finish_non_exhaustive()
    }
}
