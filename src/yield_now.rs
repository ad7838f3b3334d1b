use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Suspends the current coroutine once, sending it to the back of the immediate queue.
pub fn yield_now() -> Yield {
    Yield { yielded: false }
}

#[derive(Debug, Copy, Clone)]
#[must_use = "futures do nothing unless polled"]
pub struct Yield {
    yielded: bool,
}

impl Future for Yield {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            Pin::into_inner(self).yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
