use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::{Rc, Weak};
use alloc::sync::Arc;
use core::cell::{Cell, RefCell};
use core::task::{Context, Poll, Waker};
use std::panic::{self, AssertUnwindSafe};

use futures::future::LocalBoxFuture;
use tracing::trace;

use crate::deferred::DeferredId;
use crate::error::InvalidDelay;
use crate::report::{Incident, Reporter, panic_message};
use crate::task::{Task, Tier};
use crate::time::{Duration, Instant};
use crate::waker::{CoroutineId, CoroutineWaker, Signals};

/// Entry taken off the immediate FIFO.
pub(crate) enum Ready {
    Run(Task),
    Resume(CoroutineId),
}

/// A spawned computation between its steps.
pub(crate) struct Coroutine {
    id: CoroutineId,
    future: RefCell<LocalBoxFuture<'static, ()>>,
    waker: Waker,
    handle: Arc<CoroutineWaker>,
    // An await took ownership of the coroutine during the last poll.
    claimed: Cell<bool>,
    finished: Cell<bool>,
}

/// Number of entries waiting in each queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingTasks {
    /// Immediate tasks plus coroutine resumptions.
    pub immediate: usize,
    pub timed: usize,
    /// Coroutines parked on an unsettled await.
    pub suspended: usize,
}

impl PendingTasks {
    pub fn is_idle(&self) -> bool {
        self.immediate == 0 && self.timed == 0
    }
}

/// Queues, clock and coroutine table behind a [`Scheduler`](crate::Scheduler) handle.
///
/// A coroutine parked on a deferred is owned by that deferred's reaction, so a
/// coroutine waiting on something nobody can settle anymore is dropped together
/// with whatever it captured. The core keeps a coroutine alive itself only while
/// it is queued for resumption or waits on some other wake source.
pub(crate) struct Core {
    signals: Arc<Signals>,
    immediate: RefCell<VecDeque<(u64, Task)>>,
    timed: RefCell<BTreeMap<(Instant, u64), Task>>,
    timed_seq: Cell<u64>,
    clock: Cell<Instant>,
    coroutines: RefCell<BTreeMap<CoroutineId, Weak<Coroutine>>>,
    retained: RefCell<BTreeMap<CoroutineId, Rc<Coroutine>>>,
    current: RefCell<Option<Rc<Coroutine>>>,
    next_coroutine: Cell<CoroutineId>,
    next_deferred: Cell<u64>,
    running: Cell<bool>,
    reporter: Box<dyn Reporter>,
}

/// Marks the run loop as active until dropped, unwinding included.
pub(crate) struct Running<'a> {
    core: &'a Core,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.core.running.set(false);
    }
}

impl Core {
    pub(crate) fn new(start: Instant, reporter: Box<dyn Reporter>) -> Self {
        Self {
            signals: Arc::new(Signals::new()),
            immediate: RefCell::new(VecDeque::new()),
            timed: RefCell::new(BTreeMap::new()),
            timed_seq: Cell::new(0),
            clock: Cell::new(start),
            coroutines: RefCell::new(BTreeMap::new()),
            retained: RefCell::new(BTreeMap::new()),
            current: RefCell::new(None),
            next_coroutine: Cell::new(0),
            next_deferred: Cell::new(1),
            running: Cell::new(false),
            reporter,
        }
    }

    /// `None` if a run loop is already active.
    pub(crate) fn enter(&self) -> Option<Running<'_>> {
        if self.running.replace(true) {
            return None;
        }
        Some(Running { core: self })
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.get()
    }

    pub(crate) fn next_deferred_id(&self) -> DeferredId {
        let raw = self.next_deferred.get();
        self.next_deferred.set(raw + 1);
        DeferredId::new(raw)
    }

    pub(crate) fn report(&self, incident: &Incident) {
        self.reporter.report(incident);
    }

    pub(crate) fn enqueue_immediate(&self, task: Task) {
        let seq = self.signals.next_seq();
        self.immediate.borrow_mut().push_back((seq, task));
    }

    pub(crate) fn enqueue_timed(&self, task: Task, delay: Duration) -> Result<Instant, InvalidDelay> {
        if delay.is_negative() {
            return Err(InvalidDelay::Negative(delay));
        }
        let now = self.now();
        let due = now
            .checked_add(delay)
            .ok_or(InvalidDelay::Overflow { now, delay })?;

        let seq = self.timed_seq.get();
        self.timed_seq.set(seq + 1);
        self.timed.borrow_mut().insert((due, seq), task);
        Ok(due)
    }

    /// Takes the oldest immediate entry, merging plain tasks and coroutine wake-ups by enqueue order.
    pub(crate) fn pop_immediate(&self) -> Option<Ready> {
        let mut queue = self.immediate.borrow_mut();
        let first_task = queue.front().map(|(seq, _)| *seq);
        if let Some(id) = self.signals.pop_before(first_task) {
            return Some(Ready::Resume(id));
        }
        queue.pop_front().map(|(_, task)| Ready::Run(task))
    }

    /// Takes the earliest timed task and advances the clock to its due time.
    pub(crate) fn pop_timed(&self) -> Option<Task> {
        let ((due, _), task) = self.timed.borrow_mut().pop_first()?;
        if due > self.clock.get() {
            self.clock.set(due);
        }
        Some(task)
    }

    /// Runs one entry. A panic is reported and swallowed so the loop can continue.
    pub(crate) fn execute(&self, tier: Tier, ready: Ready) {
        self.guarded(tier, || match ready {
            Ready::Run(task) => task.run(),
            Ready::Resume(id) => self.resume(id),
        });
    }

    fn guarded(&self, tier: Tier, step: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(step)) {
            self.report(&Incident::Panicked {
                tier,
                message: panic_message(payload.as_ref()),
            });
        }
    }

    /// Registers a coroutine and runs its first step right away.
    pub(crate) fn start_coroutine(&self, future: LocalBoxFuture<'static, ()>) -> CoroutineId {
        let id = self.next_coroutine.get();
        self.next_coroutine.set(id + 1);

        let handle = CoroutineWaker::new(id, self.signals.clone());
        let coroutine = Rc::new(Coroutine {
            id,
            future: RefCell::new(future),
            waker: futures::task::waker(handle.clone()),
            handle,
            claimed: Cell::new(false),
            finished: Cell::new(false),
        });
        {
            let mut coroutines = self.coroutines.borrow_mut();
            coroutines.retain(|_, entry| entry.strong_count() > 0);
            coroutines.insert(id, Rc::downgrade(&coroutine));
        }
        trace!(coroutine = id, "coroutine started");
        self.guarded(Tier::Immediate, || self.drive(&coroutine));
        id
    }

    /// Hands the coroutine currently polled with `waker` to an await, which keeps
    /// it alive until it is given back through [`Core::retain`].
    pub(crate) fn claim_current(&self, waker: &Waker) -> Option<Rc<Coroutine>> {
        let current = self.current.borrow().clone()?;
        if !current.waker.will_wake(waker) {
            return None;
        }
        current.claimed.set(true);
        Some(current)
    }

    pub(crate) fn retain(&self, coroutine: Rc<Coroutine>) {
        if !coroutine.finished.get() {
            self.retained.borrow_mut().insert(coroutine.id, coroutine);
        }
    }

    fn resume(&self, id: CoroutineId) {
        let coroutine = self.coroutines.borrow().get(&id).and_then(Weak::upgrade);
        match coroutine {
            Some(coroutine) if !coroutine.finished.get() => self.drive(&coroutine),
            _ => trace!(coroutine = id, "stale wake-up ignored"),
        }
    }

    fn drive(&self, coroutine: &Rc<Coroutine>) {
        coroutine.handle.arm();
        coroutine.claimed.set(false);
        let outer = self.current.replace(Some(coroutine.clone()));
        let polled = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut cx = Context::from_waker(&coroutine.waker);
            coroutine.future.borrow_mut().as_mut().poll(&mut cx)
        }));
        *self.current.borrow_mut() = outer;

        match polled {
            Ok(Poll::Pending) if coroutine.claimed.get() && !coroutine.handle.is_queued() => {
                self.retained.borrow_mut().remove(&coroutine.id);
            }
            Ok(Poll::Pending) => {
                self.retained.borrow_mut().insert(coroutine.id, coroutine.clone());
            }
            Ok(Poll::Ready(())) => {
                trace!(coroutine = coroutine.id, "coroutine finished");
                self.forget(coroutine);
            }
            Err(payload) => {
                self.forget(coroutine);
                panic::resume_unwind(payload);
            }
        }
    }

    fn forget(&self, coroutine: &Coroutine) {
        coroutine.finished.set(true);
        self.coroutines.borrow_mut().remove(&coroutine.id);
        self.retained.borrow_mut().remove(&coroutine.id);
    }

    pub(crate) fn pending(&self) -> PendingTasks {
        PendingTasks {
            immediate: self.immediate.borrow().len() + self.signals.len(),
            timed: self.timed.borrow().len(),
            suspended: self
                .coroutines
                .borrow()
                .values()
                .filter(|entry| entry.strong_count() > 0)
                .count(),
        }
    }
}
