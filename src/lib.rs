//! Cooperative single-threaded scheduler with deferred values.
//!
//! A [`Scheduler`] owns two queues: an immediate queue drained in FIFO order and a
//! timed queue ordered by due time on a logical millisecond clock. Each pass of
//! [`Scheduler::run`] drains the immediate queue completely before it takes a single
//! timed task.
//!
//! A [`Deferred`] is a single-assignment cell that is pending, fulfilled or
//! rejected. Continuations registered on it always run as immediate tasks, so the
//! code that settles a deferred finishes before any of its reactions. Deferreds can
//! be chained with [`Deferred::register`], combined with [`Deferred::all`] and
//! awaited from coroutines started with [`Scheduler::spawn`].
//!
//! ```
//! use deferred_scheduler::{Deferred, Duration, Scheduler, Task};
//!
//! let scheduler = Scheduler::new();
//! let slow = scheduler.delay::<()>(Duration::from_millis(1000)).unwrap();
//! let fast = Deferred::from_value(&scheduler, ());
//! let both = Deferred::all(&scheduler, [slow, fast]);
//! scheduler.enqueue_immediate(Task::new(|| {}));
//! scheduler.run();
//! assert_eq!(both.state(), deferred_scheduler::State::Fulfilled(vec![(), ()]));
//! assert_eq!(scheduler.now().as_millis(), 1000);
//! ```

extern crate alloc;

mod deferred;
mod delay;
mod error;
mod report;
mod runtime;
mod scheduler;
mod task;
mod time;
mod waker;
mod yield_now;

#[cfg(test)]
mod test_utils;

pub use deferred::{Deferred, DeferredId, Recovery, Resolution, Settled, State};
pub use error::InvalidDelay;
pub use report::{Incident, Reporter, TracingReporter};
pub use runtime::PendingTasks;
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use task::{Task, Tier};
pub use time::{Duration, Instant};
pub use yield_now::{Yield, yield_now};
