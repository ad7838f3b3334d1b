use alloc::rc::Rc;
use core::cell::RefCell;
use core::fmt::Debug;
use core::future::{Future, IntoFuture};
use core::mem;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use super::Deferred;

struct Slot<T, E> {
    outcome: Option<Result<T, E>>,
    waker: Option<Waker>,
}

enum Stage<T, E> {
    Unpolled(Deferred<T, E>),
    Subscribed(Rc<RefCell<Slot<T, E>>>),
    Done,
}

/// Future over a deferred's outcome, created by `.await` or [`Deferred::settled`].
///
/// The first poll registers a reaction. The coroutine is woken from that reaction,
/// so it always resumes from the immediate queue, never inside the settling call.
/// Until then the suspended coroutine belongs to the awaited deferred: if that
/// deferred is dropped unsettled, the coroutine is dropped with it.
#[must_use = "futures do nothing unless polled"]
pub struct Settled<T, E> {
    stage: Stage<T, E>,
}

impl<T, E> Settled<T, E> {
    pub(crate) fn new(deferred: Deferred<T, E>) -> Self {
        Self {
            stage: Stage::Unpolled(deferred),
        }
    }
}

impl<T, E> Future for Settled<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        match mem::replace(&mut this.stage, Stage::Done) {
            Stage::Subscribed(slot) => {
                let outcome = slot.borrow_mut().outcome.take();
                match outcome {
                    Some(outcome) => Poll::Ready(outcome),
                    None => {
                        slot.borrow_mut().waker = Some(cx.waker().clone());
                        this.stage = Stage::Subscribed(slot);
                        Poll::Pending
                    }
                }
            }
            Stage::Unpolled(deferred) => {
                let slot = Rc::new(RefCell::new(Slot {
                    outcome: None,
                    waker: Some(cx.waker().clone()),
                }));
                let core = deferred.core();
                let coroutine = core.upgrade().and_then(|core| core.claim_current(cx.waker()));
                let reaction_slot = slot.clone();
                deferred.subscribe(move |outcome| {
                    let waker = {
                        let mut slot = reaction_slot.borrow_mut();
                        slot.outcome = Some(outcome);
                        slot.waker.take()
                    };
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                    if let (Some(coroutine), Some(core)) = (coroutine, core.upgrade()) {
                        core.retain(coroutine);
                    }
                });
                this.stage = Stage::Subscribed(slot);
                Poll::Pending
            }
            Stage::Done => panic!("`Settled` polled after completion"),
        }
    }
}

impl<T, E> IntoFuture for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        Settled::new(self)
    }
}
