use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt::Debug;
use core::mem;

use tracing::trace;

use super::Deferred;
use crate::scheduler::Scheduler;

struct Progress<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Waits for every input.
    ///
    /// Fulfills with the values in input order once all inputs are fulfilled. The
    /// first rejection (by settlement time) rejects the result right away; the
    /// remaining inputs keep running and whatever they produce later is discarded.
    pub fn all(
        scheduler: &Scheduler,
        deferreds: impl IntoIterator<Item = Deferred<T, E>>,
    ) -> Deferred<Vec<T>, E> {
        let inputs: Vec<_> = deferreds.into_iter().collect();
        let aggregate = Deferred::<Vec<T>, E>::pending(scheduler);
        if inputs.is_empty() {
            aggregate.settle_ok(Vec::new());
            return aggregate;
        }

        let progress = Rc::new(RefCell::new(Progress {
            values: inputs.iter().map(|_| None).collect(),
            remaining: inputs.len(),
        }));
        for (index, input) in inputs.into_iter().enumerate() {
            let progress = progress.clone();
            let aggregate = aggregate.clone();
            input.subscribe(move |outcome| match outcome {
                Ok(value) => {
                    let values = {
                        let mut progress = progress.borrow_mut();
                        progress.values[index] = Some(value);
                        progress.remaining -= 1;
                        if progress.remaining > 0 {
                            return;
                        }
                        mem::take(&mut progress.values)
                    };
                    aggregate.settle_ok(values.into_iter().flatten().collect());
                }
                Err(error) => {
                    if !aggregate.settle_err(error) {
                        trace!(aggregate = %aggregate.id(), input = index, "late rejection discarded");
                    }
                }
            });
        }
        aggregate
    }
}
