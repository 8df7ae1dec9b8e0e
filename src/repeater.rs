//! The repeating-call engine: self-reschedules against a [`RecurrenceRule`]
//! and reports a drift-free step count to `work` on every invocation.
//!
//! Lifetime: nothing external owns a `Repeater` value — the crate never
//! hands one back. Its state is kept alive by the single armed trampoline
//! `FutureCall` at any given time (the closure stored in the scheduler's
//! queue holds the only strong reference); cancel it (directly, or via
//! [`Stopper`]) and the state drops. This mirrors the "cycles via handles"
//! design note: `FutureCall` only ever holds a scheduler-weak-ref plus a
//! record id, never a strong link back to whatever scheduled it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::driver::TimeDriver;
use crate::error::FritterError;
use crate::rule::RecurrenceRule;
use crate::scheduler::{FutureCall, Scheduler};
use crate::time::TimeValue;
use crate::work::StepWork;

trait CancelTrampoline {
    fn cancel_trampoline(&mut self);
}

/// Ends a [`repeatedly`] recurrence. Tripping it from inside the running
/// `work` prevents the next reschedule; tripping it from outside cancels
/// the outstanding trampoline call immediately, so no further invocations
/// occur either way. Repeated calls are a no-op, same as
/// [`FutureCall::cancel`].
#[derive(Clone)]
pub struct Stopper {
    target: Weak<RefCell<dyn CancelTrampoline>>,
}

impl Stopper {
    pub fn cancel(&self) {
        if let Some(target) = self.target.upgrade() {
            target.borrow_mut().cancel_trampoline();
        }
    }
}

struct RepeaterState<T: TimeValue, D: TimeDriver<T>, R: RecurrenceRule<T>, F> {
    scheduler: Scheduler<T, D, Box<dyn FnMut()>>,
    rule: R,
    work: F,
    reference: T,
    next_boundary: T,
    trampoline: Option<FutureCall<T, D, Box<dyn FnMut()>>>,
    stopped: bool,
    stopper: Stopper,
}

impl<T, D, R, F> CancelTrampoline for RepeaterState<T, D, R, F>
where
    T: TimeValue,
    D: TimeDriver<T>,
    R: RecurrenceRule<T>,
{
    fn cancel_trampoline(&mut self) {
        self.stopped = true;
        if let Some(handle) = self.trampoline.take() {
            handle.cancel();
        }
    }
}

/// Schedules `work` to run at every boundary `rule` computes from
/// `reference`, receiving the drift-free step count elapsed since the
/// previous invocation. Returns a [`Stopper`] that ends the recurrence.
///
/// Fails fast, before scheduling anything, if `rule` doesn't strictly
/// advance past `scheduler.now()` — spec.md §9's "zero-length recurrence"
/// resolved as an error rather than an infinite reschedule loop.
pub fn repeatedly<T, D, R, F>(
    scheduler: &Scheduler<T, D, Box<dyn FnMut()>>,
    rule: R,
    reference: T,
    work: F,
) -> Result<Stopper, FritterError>
where
    T: TimeValue + 'static,
    D: TimeDriver<T> + 'static,
    R: RecurrenceRule<T> + 'static,
    F: StepWork + 'static,
{
    if !rule.is_valid() {
        return Err(FritterError::InvalidScale(f64::NAN));
    }

    let now = scheduler.now();
    let first_boundary = rule.next(now, reference);
    if first_boundary <= now {
        return Err(FritterError::UnknownRecurrence(format!(
            "rule did not advance past {now:?}"
        )));
    }

    let state = Rc::new(RefCell::new(RepeaterState {
        scheduler: scheduler.clone(),
        rule,
        work,
        reference,
        next_boundary: first_boundary,
        trampoline: None,
        stopped: false,
        stopper: Stopper { target: Weak::new() },
    }));

    let dyn_rc: Rc<RefCell<dyn CancelTrampoline>> = state.clone();
    let stopper = Stopper {
        target: Rc::downgrade(&dyn_rc),
    };
    state.borrow_mut().stopper = stopper.clone();

    arm_trampoline(&state);

    Ok(stopper)
}

fn arm_trampoline<T, D, R, F>(state: &Rc<RefCell<RepeaterState<T, D, R, F>>>)
where
    T: TimeValue + 'static,
    D: TimeDriver<T> + 'static,
    R: RecurrenceRule<T> + 'static,
    F: StepWork + 'static,
{
    let (next_boundary, scheduler) = {
        let s = state.borrow();
        (s.next_boundary, s.scheduler.clone())
    };
    let state_for_closure = state.clone();
    let handle = scheduler.call_at(
        next_boundary,
        Box::new(move || fire(&state_for_closure)),
    );
    state.borrow_mut().trampoline = Some(handle);
}

fn fire<T, D, R, F>(state: &Rc<RefCell<RepeaterState<T, D, R, F>>>)
where
    T: TimeValue + 'static,
    D: TimeDriver<T> + 'static,
    R: RecurrenceRule<T> + 'static,
    F: StepWork + 'static,
{
    let (t_fire, boundary_just_reached, reference, stopper) = {
        let mut s = state.borrow_mut();
        s.trampoline = None;
        (
            s.scheduler.now(),
            s.next_boundary,
            s.reference,
            s.stopper.clone(),
        )
    };

    // `boundary_just_reached` is itself always on-grid (it's a prior
    // `rule.next` result), so the boundaries *strictly after* it up to
    // `t_fire` are exactly `steps_between`'s contract; the `+1` accounts
    // for `boundary_just_reached` itself, which hasn't been reported yet.
    let extra = state.borrow().rule.steps_between(boundary_just_reached, t_fire);
    let steps = (1 + extra).min(u32::MAX as u64) as u32;
    debug!(steps, ?t_fire, "repeater firing");

    state.borrow_mut().work.run(steps, &stopper);

    if state.borrow().stopped {
        return;
    }

    let new_next = state.borrow().rule.next(t_fire, reference);
    if new_next <= t_fire {
        warn!("recurrence rule failed to advance past firing time; stopping repeater");
        return;
    }
    state.borrow_mut().next_boundary = new_next;
    arm_trampoline(state);
}
