//! The scheduler engine: owns a driver and a queue, issues cancelable
//! handles, and keeps the driver armed at the earliest live deadline.

use std::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::driver::TimeDriver;
use crate::queue::{BinaryHeapQueue, PriorityQueue};
use crate::time::TimeValue;
use crate::work::Invocable;

struct Inner<T: TimeValue, D: TimeDriver<T>, W: Invocable> {
    driver: D,
    queue: BinaryHeapQueue<T, W>,
    armed_for: Option<T>,
    firing: bool,
}

/// Owns a driver and a priority queue of pending calls. Cloning a
/// `Scheduler` shares the same underlying state — it is a thin `Rc` handle,
/// matching [`MemoryDriver`](crate::driver::MemoryDriver)'s own clone
/// semantics — so a branch's synthetic driver and the application code that
/// built the branch can both hold a live reference to the same scheduler.
pub struct Scheduler<T: TimeValue, D: TimeDriver<T>, W: Invocable> {
    inner: Rc<RefCell<Inner<T, D, W>>>,
}

impl<T: TimeValue, D: TimeDriver<T>, W: Invocable> Clone for Scheduler<T, D, W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A handle to a queued call. Carries the record's id and a non-owning
/// reference to the owning scheduler, never the scheduler itself — breaking
/// the cycle a `Repeater` would otherwise form by holding both a
/// `FutureCall` and (transitively) the scheduler it came from.
pub struct FutureCall<T: TimeValue, D: TimeDriver<T>, W: Invocable> {
    scheduler: Weak<RefCell<Inner<T, D, W>>>,
    id: u64,
    when: T,
}

impl<T: TimeValue, D: TimeDriver<T>, W: Invocable> FutureCall<T, D, W> {
    /// The deadline this call was scheduled for. Fixed at creation time —
    /// cancellation discards the record rather than mutating its deadline,
    /// so this never needs a live lookup into the queue.
    pub fn when(&self) -> T {
        self.when
    }

    /// Marks the record canceled and removes it from the queue. A no-op if
    /// the record already fired or was already canceled — including a
    /// cancel called on the record's own id from inside its own firing,
    /// since by then the fire routine has already removed it.
    pub fn cancel(&self) {
        let Some(inner_rc) = self.scheduler.upgrade() else {
            return;
        };
        let removed = inner_rc.borrow_mut().queue.remove_token(self.id).is_some();
        if removed {
            trace!(id = self.id, "future call canceled");
            Scheduler::maybe_rearm(&inner_rc);
        }
    }
}

impl<T: TimeValue, D: TimeDriver<T>, W: Invocable> Scheduler<T, D, W> {
    pub fn new(driver: D) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                driver,
                queue: BinaryHeapQueue::new(),
                armed_for: None,
                firing: false,
            })),
        }
    }

    /// The scheduler's current time. Delegates to the driver; a branch
    /// overrides this by wrapping a synthetic [`TimeDriver`] that applies
    /// the linear time transform instead of changing anything here.
    pub fn now(&self) -> T {
        self.inner.borrow().driver.now()
    }

    /// Schedules `work` to run at `when`. A deadline at or before `now()` is
    /// not an error (spec's `ScheduleInPast` is not a reportable condition)
    /// — it simply fires on the next wake-up, which for a past deadline
    /// means "as soon as the driver yields control."
    pub fn call_at(&self, when: T, work: W) -> FutureCall<T, D, W> {
        let id = {
            let mut inner = self.inner.borrow_mut();
            inner.queue.add(when, work)
        };
        Self::maybe_rearm(&self.inner);
        FutureCall {
            scheduler: Rc::downgrade(&self.inner),
            id,
            when,
        }
    }

    /// Re-arms the driver to the queue's current head, or unschedules it if
    /// the queue is empty — unless a fire pass is in progress, in which case
    /// the fire routine itself re-arms exactly once on exit (spec.md §4.3
    /// step 1/5). Idempotent: a call that doesn't actually change the armed
    /// deadline touches neither the driver nor `armed_for`.
    fn maybe_rearm(inner_rc: &Rc<RefCell<Inner<T, D, W>>>) {
        let mut inner = inner_rc.borrow_mut();
        if inner.firing {
            return;
        }
        let head = inner.queue.peek_min().map(|(d, _)| d);
        match head {
            Some(deadline) => {
                if inner.armed_for != Some(deadline) {
                    let weak = Rc::downgrade(inner_rc);
                    inner.driver.reschedule(
                        deadline,
                        Box::new(move || {
                            if let Some(strong) = weak.upgrade() {
                                Scheduler::fire(&strong);
                            }
                        }),
                    );
                    inner.armed_for = Some(deadline);
                }
            }
            None => {
                if inner.armed_for.is_some() {
                    inner.driver.unschedule();
                    inner.armed_for = None;
                }
            }
        }
    }

    /// The fire routine, invoked by the driver's wake-up. Drains every
    /// record whose deadline has passed, in `(deadline, id)` order,
    /// including records inserted reentrantly by work it has already run in
    /// this same pass, then re-arms exactly once.
    fn fire(inner_rc: &Rc<RefCell<Inner<T, D, W>>>) {
        {
            let mut inner = inner_rc.borrow_mut();
            inner.firing = true;
            // The driver's wake-up is one-shot and has already fired; the
            // scheduler isn't armed again until this pass re-arms below.
            inner.armed_for = None;
        }
        let t = inner_rc.borrow().driver.now();
        loop {
            let due = {
                let mut inner = inner_rc.borrow_mut();
                matches!(inner.queue.peek_min(), Some((deadline, _)) if deadline <= t)
            };
            if !due {
                break;
            }
            let item = inner_rc.borrow_mut().queue.remove_min();
            let Some((deadline, mut work)) = item else {
                break;
            };
            trace!(?deadline, "firing call");
            // `work` is owned locally and the RefCell borrow above has
            // already ended, so reentrant `call_at`/`cancel` calls from
            // inside `work.run()` borrow cleanly.
            let result = catch_unwind(AssertUnwindSafe(|| work.run()));
            if let Err(payload) = result {
                let mut inner = inner_rc.borrow_mut();
                inner.firing = false;
                drop(inner);
                Self::maybe_rearm(inner_rc);
                resume_unwind(payload);
            }
        }
        {
            let mut inner = inner_rc.borrow_mut();
            inner.firing = false;
        }
        Self::maybe_rearm(inner_rc);
    }

    /// Bulk re-insert of previously-persisted calls. Each item is handed to
    /// `call_at` in iteration order, so it gets a fresh id assigned in that
    /// same order — exactly spec.md §6's "bulk re-insert operation that
    /// reassigns fresh ids while preserving (deadline,
    /// original-insertion-order)": items sharing a deadline keep their
    /// original relative firing order under the FIFO tie-break.
    pub fn bulk_import(&self, items: impl IntoIterator<Item = (T, W)>) -> Vec<FutureCall<T, D, W>> {
        items
            .into_iter()
            .map(|(when, work)| self.call_at(when, work))
            .collect()
    }

    /// Number of live (non-canceled) pending calls.
    pub fn pending_len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Whether the driver currently has an outstanding wake-up installed.
    pub fn is_armed(&self) -> bool {
        self.inner.borrow().armed_for.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::time::Seconds;
    use std::cell::RefCell as StdRefCell;

    fn log_scheduler() -> (Scheduler<Seconds, MemoryDriver<Seconds>, Box<dyn FnMut()>>, MemoryDriver<Seconds>) {
        let driver = MemoryDriver::new(Seconds(0.0));
        let sched = Scheduler::new(driver.clone());
        (sched, driver)
    }

    #[test]
    fn s1_fifo_tie_break() {
        let (sched, driver) = log_scheduler();
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let log_a = log.clone();
        let log_b = log.clone();
        sched.call_at(Seconds(1.0), Box::new(move || log_a.borrow_mut().push('A')));
        sched.call_at(Seconds(1.0), Box::new(move || log_b.borrow_mut().push('B')));
        driver.advance();
        assert_eq!(*log.borrow(), vec!['A', 'B']);
        assert_eq!(driver.now(), Seconds(1.0));
    }

    #[test]
    fn s2_cancel_head_rearms_to_new_minimum() {
        let (sched, driver) = log_scheduler();
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let log_b = log.clone();
        let h1 = sched.call_at(Seconds(1.0), Box::new(|| panic!("A must not fire")));
        sched.call_at(Seconds(2.0), Box::new(move || log_b.borrow_mut().push('B')));
        h1.cancel();
        driver.advance();
        assert_eq!(*log.borrow(), vec!['B']);
        assert_eq!(driver.now(), Seconds(2.0));
    }

    #[test]
    fn s3_reentrant_same_tick_insert_fires_in_same_pass() {
        let (sched, driver) = log_scheduler();
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let log_outer = log.clone();
        let log_inner = log.clone();
        let sched_inner = sched.clone();
        sched.call_at(
            Seconds(1.0),
            Box::new(move || {
                log_outer.borrow_mut().push("outer");
                let log_b = log_inner.clone();
                sched_inner.call_at(Seconds(1.0), Box::new(move || log_b.borrow_mut().push("B")));
            }),
        );
        driver.advance();
        assert_eq!(*log.borrow(), vec!["outer", "B"]);
        assert_eq!(driver.now(), Seconds(1.0));
        assert_eq!(sched.pending_len(), 0);
        assert!(!sched.is_armed());
    }

    #[test]
    fn bulk_import_preserves_original_order_among_equal_deadlines() {
        let (sched, driver) = log_scheduler();
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let log_a = log.clone();
        let log_b = log.clone();
        let handles = sched.bulk_import(vec![
            (Seconds(1.0), Box::new(move || log_a.borrow_mut().push('A')) as Box<dyn FnMut()>),
            (Seconds(1.0), Box::new(move || log_b.borrow_mut().push('B')) as Box<dyn FnMut()>),
        ]);
        assert_eq!(handles.len(), 2);
        driver.advance();
        assert_eq!(*log.borrow(), vec!['A', 'B']);
    }

    #[test]
    fn double_cancel_is_a_noop() {
        let (sched, _driver) = log_scheduler();
        let h = sched.call_at(Seconds(5.0), Box::new(|| {}));
        h.cancel();
        h.cancel();
        assert_eq!(sched.pending_len(), 0);
    }

    #[test]
    fn cancel_after_fire_is_a_noop() {
        let (sched, driver) = log_scheduler();
        let h = sched.call_at(Seconds(1.0), Box::new(|| {}));
        driver.advance();
        h.cancel();
        assert_eq!(sched.pending_len(), 0);
    }

    #[test]
    fn schedule_in_past_fires_on_next_wake_up() {
        let (sched, driver) = log_scheduler();
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let log2 = log.clone();
        driver.advance_by(10.0);
        sched.call_at(Seconds(1.0), Box::new(move || log2.borrow_mut().push(())));
        driver.advance();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn panicking_work_still_lets_remaining_due_work_run_next_wake_up() {
        let (sched, driver) = log_scheduler();
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let log2 = log.clone();
        sched.call_at(Seconds(1.0), Box::new(|| panic!("boom")));
        sched.call_at(Seconds(1.0), Box::new(move || log2.borrow_mut().push("B")));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| driver.advance()));
        assert!(result.is_err());
        // The panic unwound out of `advance`, but the second same-tick
        // record is still queued and armed for the next wake-up.
        assert_eq!(sched.pending_len(), 1);
        assert!(sched.is_armed());
        driver.advance();
        assert_eq!(*log.borrow(), vec!["B"]);
    }
}
