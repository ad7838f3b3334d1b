//! Single-assignment deferred values.
//!
//! A [`Deferred`] starts out pending and settles at most once, either fulfilled
//! with a value or rejected with an error. Reactions registered on it never run
//! inline: once the deferred is settled each reaction becomes an immediate task
//! on the scheduler that owns it.

use alloc::boxed::Box;
use alloc::format;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::{fmt, mem};

use tracing::{debug, trace, warn};

use crate::report::Incident;
use crate::runtime::Core;
use crate::scheduler::Scheduler;
use crate::task::Task;

mod combinators;
mod settled;

pub use settled::Settled;

/// Identifies a deferred in logs and incident reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeferredId(u64);

impl DeferredId {
    /// Id of a deferred created after its scheduler was dropped.
    pub const DETACHED: Self = DeferredId(0);

    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deferred#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, State::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, State::Rejected(_))
    }

    fn label(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
        }
    }
}

/// What a reaction produced: a plain value, or another deferred whose eventual
/// outcome the result adopts.
pub enum Resolution<T, E> {
    Value(T),
    Adopt(Deferred<T, E>),
}

impl<T, E> From<Deferred<T, E>> for Resolution<T, E> {
    fn from(deferred: Deferred<T, E>) -> Self {
        Resolution::Adopt(deferred)
    }
}

/// Error branch of [`Deferred::register`].
pub type Recovery<U, E> = Box<dyn FnOnce(E) -> Result<Resolution<U, E>, E>>;

type Reaction<T, E> = Box<dyn FnOnce(Result<T, E>)>;
type FmtError<E> = fn(&E, &mut fmt::Formatter<'_>) -> fmt::Result;

struct Inner<T, E> {
    id: DeferredId,
    state: State<T, E>,
    reactions: Vec<Reaction<T, E>>,
    // Set once the deferred has been resolved with another deferred; direct settles are ignored after that.
    locked: bool,
    handled: bool,
    core: Weak<Core>,
    fmt_error: FmtError<E>,
}

/// Value of type `T` that becomes known later, or fails with `E`.
///
/// Cloning yields another handle to the same cell.
pub struct Deferred<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Deferred<T, E> {
    pub(crate) fn core(&self) -> Weak<Core> {
        self.inner.borrow().core.clone()
    }

    pub fn id(&self) -> DeferredId {
        self.inner.borrow().id
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().state.is_pending()
    }

    fn is_same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    pub fn pending(scheduler: &Scheduler) -> Self {
        Self::attached(scheduler.downgrade())
    }

    /// Already fulfilled deferred. Reactions on it are still deferred to the immediate queue.
    pub fn from_value(scheduler: &Scheduler, value: T) -> Self {
        let deferred = Self::pending(scheduler);
        deferred.settle_ok(value);
        deferred
    }

    /// Already rejected deferred. Reactions on it are still deferred to the immediate queue.
    pub fn from_error(scheduler: &Scheduler, error: E) -> Self {
        let deferred = Self::pending(scheduler);
        deferred.settle_err(error);
        deferred
    }

    fn attached(core: Weak<Core>) -> Self {
        let id = core
            .upgrade()
            .map_or(DeferredId::DETACHED, |core| core.next_deferred_id());
        Self {
            inner: Rc::new(RefCell::new(Inner {
                id,
                state: State::Pending,
                reactions: Vec::new(),
                locked: false,
                handled: false,
                core,
                fmt_error: <E as fmt::Debug>::fmt,
            })),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> State<T, E> {
        self.inner.borrow().state.clone()
    }

    /// Fulfills a pending deferred. Returns `false`, changing nothing, if it was already settled.
    pub fn settle_ok(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Rejects a pending deferred. Returns `false`, changing nothing, if it was already settled.
    pub fn settle_err(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    /// Settles from a reaction's outcome. [`Resolution::Adopt`] makes this deferred
    /// follow the other one; from then on direct settles are ignored.
    pub fn settle_with(&self, resolution: Result<Resolution<T, E>, E>) {
        match resolution {
            Ok(Resolution::Value(value)) => {
                self.settle_ok(value);
            }
            Err(error) => {
                self.settle_err(error);
            }
            Ok(Resolution::Adopt(source)) => {
                if source.is_same(self) {
                    warn!(deferred = %self.id(), "deferred cannot adopt itself; left pending");
                    return;
                }
                {
                    let mut inner = self.inner.borrow_mut();
                    if inner.locked || inner.state.is_settled() {
                        debug!(deferred = %inner.id, "adoption ignored: already resolved");
                        return;
                    }
                    inner.locked = true;
                }
                trace!(deferred = %self.id(), source = %source.id(), "adopting");
                let target = self.clone();
                source.subscribe(move |outcome| {
                    target.complete(outcome);
                });
            }
        }
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        if self.inner.borrow().locked {
            debug!(deferred = %self.id(), "settle ignored: following another deferred");
            return false;
        }
        self.complete(outcome)
    }

    fn complete(&self, outcome: Result<T, E>) -> bool {
        let (id, core, reactions) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_settled() {
                debug!(deferred = %inner.id, state = inner.state.label(), "settle ignored: already settled");
                return false;
            }
            inner.state = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(error) => State::Rejected(error.clone()),
            };
            trace!(
                deferred = %inner.id,
                state = inner.state.label(),
                reactions = inner.reactions.len(),
                "settled"
            );
            (inner.id, inner.core.clone(), mem::take(&mut inner.reactions))
        };

        for reaction in reactions {
            schedule(&core, id, reaction, outcome.clone());
        }
        true
    }

    /// Runs `reaction` with the outcome as an immediate task once settled, or right
    /// after the current task if already settled. Marks the rejection as handled.
    pub(crate) fn subscribe(&self, reaction: impl FnOnce(Result<T, E>) + 'static) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.handled = true;
        let outcome = match &inner.state {
            State::Pending => {
                inner.reactions.push(Box::new(reaction));
                return;
            }
            State::Fulfilled(value) => Ok(value.clone()),
            State::Rejected(error) => Err(error.clone()),
        };
        let (id, core) = (inner.id, inner.core.clone());
        drop(guard);

        schedule(&core, id, Box::new(reaction), outcome);
    }

    /// Chains a continuation and returns the deferred it settles.
    ///
    /// `on_ok` receives the value, `on_err` the error. Whichever runs decides the
    /// result: `Ok(Resolution::Value)` fulfills it, `Ok(Resolution::Adopt)` makes it
    /// follow another deferred and `Err` rejects it. Without `on_err` a rejection
    /// passes through unchanged and `on_ok` is never called.
    pub fn register<U, F>(&self, on_ok: F, on_err: Option<Recovery<U, E>>) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        let result = Deferred::<U, E>::attached(self.inner.borrow().core.clone());
        let target = result.clone();
        self.subscribe(move |outcome| {
            let resolution = match outcome {
                Ok(value) => on_ok(value),
                Err(error) => match on_err {
                    Some(recover) => recover(error),
                    None => Err(error),
                },
            };
            target.settle_with(resolution);
        });
        result
    }

    /// Maps the value. Returning `Err` rejects the result.
    pub fn then<U, F>(&self, on_ok: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, E> + 'static,
    {
        self.register(move |value| on_ok(value).map(Resolution::Value), None)
    }

    /// Continues with another deferred; the result settles when that one does.
    pub fn and_then<U, F>(&self, on_ok: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<U, E> + 'static,
    {
        self.register(move |value| Ok(Resolution::Adopt(on_ok(value))), None)
    }

    /// Turns a rejection back into a value. Fulfillments pass through untouched.
    pub fn catch<F>(&self, on_err: F) -> Deferred<T, E>
    where
        F: FnOnce(E) -> Result<T, E> + 'static,
    {
        let recovery: Recovery<T, E> = Box::new(move |error| on_err(error).map(Resolution::Value));
        self.register(|value| Ok(Resolution::Value(value)), Some(recovery))
    }

    /// Future resolving to this deferred's outcome. Only makes progress inside
    /// a coroutine started with [`Scheduler::spawn`].
    pub fn settled(&self) -> Settled<T, E> {
        Settled::new(self.clone())
    }
}

fn schedule<T: 'static, E: 'static>(
    core: &Weak<Core>,
    id: DeferredId,
    reaction: Reaction<T, E>,
    outcome: Result<T, E>,
) {
    match core.upgrade() {
        Some(core) => core.enqueue_immediate(Task::new(move || reaction(outcome))),
        None => warn!(deferred = %id, "scheduler dropped; reaction discarded"),
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Deferred")
                .field("id", &inner.id)
                .field("state", &inner.state.label())
                .finish(),
            Err(_) => f.debug_struct("Deferred").finish_non_exhaustive(),
        }
    }
}

struct ErrorDebug<'a, E> {
    error: &'a E,
    fmt: FmtError<E>,
}

impl<E> fmt::Debug for ErrorDebug<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.fmt)(self.error, f)
    }
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        if self.handled {
            return;
        }
        let State::Rejected(error) = &self.state else {
            return;
        };
        let incident = Incident::UnhandledRejection {
            deferred: self.id,
            error: format!("{:?}", ErrorDebug { error, fmt: self.fmt_error }),
        };
        match self.core.upgrade() {
            Some(core) => core.report(&incident),
            None => warn!(%incident, "rejection dropped after its scheduler"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Journal, collecting_scheduler};
    use crate::task::Tier;
    use alloc::string::{String, ToString};
    use alloc::vec;

    #[test]
    fn second_settle_is_ignored() {
        let scheduler = Scheduler::new();
        let d = Deferred::<i32, String>::pending(&scheduler);

        assert!(d.settle_ok(1));
        assert!(!d.settle_ok(2));
        assert!(!d.settle_err("late".into()));
        assert_eq!(d.state(), State::Fulfilled(1));

        let journal = Journal::new();
        let record = journal.clone();
        d.then(move |v| {
            record.record(v.to_string());
            Ok(())
        });
        scheduler.run();
        assert_eq!(journal.entries(), ["1"]);
    }

    #[test]
    fn reactions_never_run_inline() {
        let scheduler = Scheduler::new();
        let journal = Journal::new();
        let d = Deferred::<&str, ()>::from_value(&scheduler, "ready");

        let record = journal.clone();
        d.then(move |v| {
            record.record(v);
            Ok(())
        });
        journal.record("sync");
        assert_eq!(journal.entries(), ["sync"]);

        scheduler.run();
        assert_eq!(journal.entries(), ["sync", "ready"]);
    }

    #[test]
    fn reactions_run_in_registration_order() {
        let scheduler = Scheduler::new();
        let journal = Journal::new();
        let d = Deferred::<u8, ()>::pending(&scheduler);

        for label in ["first", "second", "third"] {
            let record = journal.clone();
            d.then(move |_| {
                record.record(label);
                Ok(())
            });
        }
        d.settle_ok(0);
        assert!(journal.entries().is_empty());

        scheduler.run();
        assert_eq!(journal.entries(), ["first", "second", "third"]);
    }

    #[test]
    fn rejection_skips_value_handler() {
        let scheduler = Scheduler::new();
        let journal = Journal::new();
        let d = Deferred::<i32, &str>::from_error(&scheduler, "bad");

        let record = journal.clone();
        let chained = d.register(
            move |v| {
                record.record("on_ok called");
                Ok(Resolution::Value(v + 1))
            },
            None,
        );
        let observed = chained.catch(|e| {
            assert_eq!(e, "bad");
            Ok(0)
        });
        scheduler.run();

        assert!(journal.entries().is_empty());
        assert_eq!(chained.state(), State::Rejected("bad"));
        assert_eq!(observed.state(), State::Fulfilled(0));
    }

    #[test]
    fn handler_error_rejects_result() {
        let scheduler = Scheduler::new();
        let d = Deferred::<i32, String>::from_value(&scheduler, 5);

        let failed = d.then(|v| -> Result<i32, String> { Err(format!("cannot use {v}")) });
        let recovered = failed.catch(|e| Ok(e.len() as i32));
        scheduler.run();

        assert_eq!(failed.state(), State::Rejected("cannot use 5".to_string()));
        assert_eq!(recovered.state(), State::Fulfilled(12));
    }

    #[test]
    fn recovery_can_reject_again() {
        let scheduler = Scheduler::new();
        let d = Deferred::<i32, String>::from_error(&scheduler, "first".into());
        let recovery: Recovery<i32, String> = Box::new(|e| Err(format!("{e}, then second")));
        let result = d.register(|v| Ok(Resolution::Value(v)), Some(recovery));
        let handled = result.catch(|_| Ok(-1));
        scheduler.run();

        assert_eq!(result.state(), State::Rejected("first, then second".to_string()));
        assert_eq!(handled.state(), State::Fulfilled(-1));
    }

    #[test]
    fn returned_deferred_is_flattened() {
        let scheduler = Scheduler::new();
        let inner = Deferred::<&str, ()>::pending(&scheduler);

        let source = Deferred::<i32, ()>::from_value(&scheduler, 1);
        let inner_handle = inner.clone();
        let outer = source.and_then(move |_| inner_handle);

        let timer = inner.clone();
        scheduler
            .enqueue_timed(
                Task::new(move || {
                    timer.settle_ok("inner value");
                }),
                crate::Duration::from_millis(30),
            )
            .unwrap();

        let observed = Rc::new(RefCell::new(None));
        let slot = observed.clone();
        let clock = scheduler.clone();
        outer.then(move |v| {
            *slot.borrow_mut() = Some((v, clock.now()));
            Ok(())
        });
        scheduler.run();

        assert_eq!(outer.state(), State::Fulfilled("inner value"));
        assert_eq!(*observed.borrow(), Some(("inner value", crate::Instant::from_millis(30))));
    }

    #[test]
    fn flattening_is_recursive_and_carries_rejections() {
        let scheduler = Scheduler::new();
        let innermost = Deferred::<i32, &str>::from_error(&scheduler, "deep failure");
        let middle = Deferred::<i32, &str>::pending(&scheduler);
        middle.settle_with(Ok(Resolution::Adopt(innermost)));
        let outer = Deferred::<i32, &str>::pending(&scheduler);
        outer.settle_with(Ok(middle.clone().into()));

        assert!(outer.is_pending());
        let caught = outer.catch(|_| Ok(1));
        scheduler.run();

        assert_eq!(middle.state(), State::Rejected("deep failure"));
        assert_eq!(outer.state(), State::Rejected("deep failure"));
        assert_eq!(caught.state(), State::Fulfilled(1));
    }

    #[test]
    fn adopting_locks_out_direct_settles() {
        let scheduler = Scheduler::new();
        let source = Deferred::<i32, ()>::pending(&scheduler);
        let follower = Deferred::<i32, ()>::pending(&scheduler);
        follower.settle_with(Ok(Resolution::Adopt(source.clone())));

        assert!(!follower.settle_ok(99));
        source.settle_ok(1);
        scheduler.run();
        assert_eq!(follower.state(), State::Fulfilled(1));
    }

    #[test]
    fn self_adoption_is_refused() {
        let scheduler = Scheduler::new();
        let d = Deferred::<i32, ()>::pending(&scheduler);
        d.settle_with(Ok(Resolution::Adopt(d.clone())));
        scheduler.run();

        assert!(d.is_pending());
        assert!(d.settle_ok(3));
    }

    #[test]
    fn unhandled_rejection_is_reported_on_drop() {
        let (scheduler, incidents) = collecting_scheduler();
        let d = Deferred::<i32, &str>::from_error(&scheduler, "nobody listened");
        let id = d.id();
        drop(d);

        assert_eq!(
            *incidents.borrow(),
            [Incident::UnhandledRejection {
                deferred: id,
                error: "\"nobody listened\"".into(),
            }]
        );
    }

    #[test]
    fn rejection_reported_at_end_of_chain_only() {
        let (scheduler, incidents) = collecting_scheduler();
        let d = Deferred::<i32, &str>::pending(&scheduler);
        let tail = d.then(|v| Ok(v * 2));
        let tail_id = tail.id();
        drop(tail);
        d.settle_err("broken");
        scheduler.run();
        drop(d);

        let incidents = incidents.borrow();
        assert_eq!(incidents.len(), 1);
        assert!(matches!(
            &incidents[0],
            Incident::UnhandledRejection { deferred, .. } if *deferred == tail_id
        ));
    }

    #[test]
    fn caught_rejection_is_not_reported() {
        let (scheduler, incidents) = collecting_scheduler();
        let d = Deferred::<i32, &str>::from_error(&scheduler, "handled");
        d.catch(|_| Ok(0));
        drop(d);
        scheduler.run();

        assert!(incidents.borrow().is_empty());
    }

    #[test]
    fn debug_shows_id_and_state() {
        let scheduler = Scheduler::new();
        let d = Deferred::<i32, ()>::pending(&scheduler);
        let rendered = format!("{d:?}");
        assert!(rendered.contains("pending"), "{rendered}");
        d.settle_ok(1);
        assert!(format!("{d:?}").contains("fulfilled"));
        assert_eq!(d.id().to_string(), format!("deferred#{}", d.id().as_u64()));
    }

    #[test]
    fn state_predicates() {
        let states: Vec<State<i32, ()>> = vec![State::Pending, State::Fulfilled(1), State::Rejected(())];
        let flags: Vec<_> = states
            .iter()
            .map(|s| (s.is_pending(), s.is_settled(), s.is_fulfilled(), s.is_rejected()))
            .collect();
        assert_eq!(
            flags,
            [
                (true, false, false, false),
                (false, true, true, false),
                (false, true, false, true)
            ]
        );
    }

    #[test]
    fn panicking_reaction_leaves_its_result_pending() {
        let (scheduler, incidents) = collecting_scheduler();
        let source = Deferred::<i32, &str>::from_value(&scheduler, 1);
        let derived = source.then(|_| -> Result<i32, &str> { panic!("reaction exploded") });
        let recovered = derived.catch(|_| Ok(0));
        scheduler.run();

        // Nothing settles the derived deferred, so the rest of the chain stalls.
        assert!(derived.is_pending());
        assert!(recovered.is_pending());
        assert!(scheduler.pending().is_idle());
        assert_eq!(
            *incidents.borrow(),
            [Incident::Panicked {
                tier: Tier::Immediate,
                message: "reaction exploded".into(),
            }]
        );
    }
}
