use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::RefCell;

use critical_section::Mutex;
use futures::task::ArcWake;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

pub(crate) type CoroutineId = u64;

/// State shared between a scheduler and every waker it hands out.
///
/// Immediate tasks and coroutine wake-ups draw sequence numbers from the same
/// counter, so the run loop can merge both into a single FIFO.
pub(crate) struct Signals {
    next_seq: AtomicU64,
    woken: Mutex<RefCell<VecDeque<(u64, CoroutineId)>>>,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            woken: Mutex::new(RefCell::new(VecDeque::new())),
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::AcqRel)
    }

    fn push(&self, id: CoroutineId) {
        critical_section::with(|cs| {
            let seq = self.next_seq();
            self.woken.borrow_ref_mut(cs).push_back((seq, id));
        })
    }

    /// Pops the oldest wake-up if it was recorded before `seq`.
    /// With `None` the oldest wake-up is popped unconditionally.
    pub(crate) fn pop_before(&self, seq: Option<u64>) -> Option<CoroutineId> {
        critical_section::with(|cs| {
            let mut woken = self.woken.borrow_ref_mut(cs);
            match (woken.front(), seq) {
                (None, _) => None,
                (Some(&(woken_seq, _)), Some(limit)) if woken_seq > limit => None,
                (Some(_), _) => woken.pop_front().map(|(_, id)| id),
            }
        })
    }

    pub(crate) fn len(&self) -> usize {
        critical_section::with(|cs| self.woken.borrow_ref(cs).len())
    }
}

/// Waker of a single suspended coroutine.
pub(crate) struct CoroutineWaker {
    id: CoroutineId,
    queued: AtomicBool,
    signals: Arc<Signals>,
}

impl CoroutineWaker {
    pub(crate) fn new(id: CoroutineId, signals: Arc<Signals>) -> Arc<Self> {
        Arc::new(Self {
            id,
            queued: AtomicBool::new(false),
            signals,
        })
    }

    /// Must be called right before polling, so that a wake during the poll queues it again.
    pub(crate) fn arm(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    fn schedule(&self) {
        // Several wakes before the next poll collapse into one resumption.
        if !self.queued.swap(true, Ordering::AcqRel) {
            self.signals.push(self.id);
        }
    }
}

impl ArcWake for CoroutineWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}
