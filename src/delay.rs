use core::fmt::Debug;

use crate::deferred::Deferred;
use crate::error::InvalidDelay;
use crate::scheduler::Scheduler;
use crate::task::Task;
use crate::time::Duration;

impl Scheduler {
    /// Deferred fulfilled by a timed task once `duration` has elapsed on the logical clock.
    pub fn delay<E>(&self, duration: Duration) -> Result<Deferred<(), E>, InvalidDelay>
    where
        E: Clone + Debug + 'static,
    {
        let deferred = Deferred::pending(self);
        let timer = deferred.clone();
        self.enqueue_timed(
            Task::new(move || {
                timer.settle_ok(());
            }),
            duration,
        )?;
        Ok(deferred)
    }
}
