use thiserror::Error;

use crate::time::{Duration, Instant};

/// Rejected argument to [`Scheduler::enqueue_timed`](crate::Scheduler::enqueue_timed)
/// and [`Scheduler::delay`](crate::Scheduler::delay).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidDelay {
    #[error("delay must not be negative, got {0}")]
    Negative(Duration),
    #[error("delay of {delay} from {now} overflows the logical clock")]
    Overflow { now: Instant, delay: Duration },
}
