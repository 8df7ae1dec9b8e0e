//! The [`TimeDriver`] contract and its two shipped implementations.
//!
//! The scheduler never cares *how* a wake-up arrives, only that `reschedule`
//! installs exactly one and `unschedule` clears it. `MemoryDriver` and
//! `SleepDriver` are promoted from "assumed external" (spec.md §4.1) to
//! shipped, because the end-to-end scenarios and this crate's own test
//! suite can't be written deterministically without the former, and the
//! crate wants at least one non-virtual way to run standalone.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::time::{Seconds, TimeValue};

/// A single pending wake-up, consumed by whichever call installed it last.
pub type Wake = Box<dyn FnMut()>;

/// An abstraction over an external clock: reports the time, arms a single
/// future wake-up, and cancels it.
///
/// `reschedule` must not invoke `wake` reentrantly — the scheduler relies on
/// returning from `reschedule` before its own bookkeeping for the new
/// deadline is visible to the callback.
pub trait TimeDriver<T: TimeValue> {
    fn now(&self) -> T;
    fn reschedule(&mut self, deadline: T, wake: Wake);
    fn unschedule(&mut self);
}

struct MemoryState<T: TimeValue> {
    now: T,
    pending: Option<(T, Wake)>,
}

/// A virtual clock advanced manually, for deterministic tests.
///
/// Cloning shares the underlying state (it is an `Rc<RefCell<..>>` handle,
/// the same pattern [`Scheduler`](crate::scheduler::Scheduler) itself uses)
/// so a test can hand one clone to `Scheduler::new` and keep another to
/// drive `advance`/`advance_by` from outside.
pub struct MemoryDriver<T: TimeValue> {
    state: Rc<RefCell<MemoryState<T>>>,
}

impl<T: TimeValue> Clone for MemoryDriver<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: TimeValue> MemoryDriver<T> {
    pub fn new(start: T) -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState {
                now: start,
                pending: None,
            })),
        }
    }

    /// Whether a wake-up is currently installed.
    pub fn is_scheduled(&self) -> bool {
        self.state.borrow().pending.is_some()
    }

    /// No-op if nothing is scheduled. Otherwise sets `now` to the pending
    /// deadline, fires it, and stops — it does not cascade into whatever
    /// the fired work schedules next.
    pub fn advance(&self) {
        let deadline = self.state.borrow().pending.as_ref().map(|(d, _)| *d);
        if let Some(deadline) = deadline {
            self.fire_pending(deadline);
        }
    }

    /// Moves the clock forward by `delta`, firing everything due along the
    /// way, in deadline order, before settling on the target time.
    pub fn advance_by(&self, delta: T::Duration) {
        let target = self.state.borrow().now.add_duration(delta);
        loop {
            let next_due = self.state.borrow().pending.as_ref().map(|(d, _)| *d);
            match next_due {
                Some(d) if d <= target => self.fire_pending(d),
                _ => break,
            }
        }
        self.state.borrow_mut().now = target;
    }

    fn fire_pending(&self, deadline: T) {
        let wake = self.state.borrow_mut().pending.take().map(|(_, w)| w);
        self.state.borrow_mut().now = deadline;
        if let Some(mut wake) = wake {
            wake();
        }
    }

    /// Moves the clock directly to `target` and, if a wake-up is pending
    /// and due by then, fires it exactly once with `now()` already reading
    /// `target` — instead of `advance_by`'s loop, which re-checks the
    /// pending wake-up after every fire and so never lets a late wake-up
    /// reach the scheduler in the first place (whatever the fired work
    /// reschedules next is always caught by that same loop if it's still
    /// due).
    ///
    /// This is how a host driver that can miss wake-ups or batch multiple
    /// ticks into one poll would actually behave (spec.md §7's tolerated
    /// `DriverMisbehavior`): `Scheduler::fire`'s own loop still drains
    /// everything due as of `target` in one pass, so a `Repeater`'s
    /// trampoline here observes a `t_fire` that can be many boundaries past
    /// the one it last armed for, and reports the whole gap as a single
    /// `steps` count instead of one reschedule per boundary.
    pub fn jump_by(&self, delta: T::Duration) {
        let target = self.state.borrow().now.add_duration(delta);
        let due = self
            .state
            .borrow()
            .pending
            .as_ref()
            .is_some_and(|(d, _)| *d <= target);
        if due {
            let wake = self.state.borrow_mut().pending.take().map(|(_, w)| w);
            self.state.borrow_mut().now = target;
            if let Some(mut wake) = wake {
                wake();
            }
        } else {
            self.state.borrow_mut().now = target;
        }
    }
}

impl<T: TimeValue> TimeDriver<T> for MemoryDriver<T> {
    fn now(&self) -> T {
        self.state.borrow().now
    }

    fn reschedule(&mut self, deadline: T, wake: Wake) {
        self.state.borrow_mut().pending = Some((deadline, wake));
    }

    fn unschedule(&mut self) {
        self.state.borrow_mut().pending = None;
    }
}

/// Blocks the calling thread via `std::thread::sleep` until each installed
/// deadline, then invokes the work inline. Only implemented for the shipped
/// [`Seconds`] time value — converting an arbitrary `T::Duration` into a
/// real `std::time::Duration` isn't something the generic core can know how
/// to do, and a driver that actually sleeps has to.
///
/// `now()` is anchored to a monotonic `Instant` captured at construction
/// rather than re-sampling `SystemTime::now()` on every call: `SystemTime`
/// can step backward under an NTP adjustment, which would violate spec.md
/// §4.1's "non-decreasing value between successive calls" requirement.
/// `epoch_offset` converts that monotonic elapsed time back into
/// seconds-since-epoch, so `Seconds` values stay comparable to whatever
/// wall-clock deadlines a caller computes from `SystemTime` elsewhere.
#[derive(Clone)]
pub struct SleepDriver {
    pending: Rc<RefCell<Option<(Seconds, Wake)>>>,
    epoch_offset: f64,
    start: Instant,
}

impl Default for SleepDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SleepDriver {
    pub fn new() -> Self {
        let epoch_offset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            pending: Rc::new(RefCell::new(None)),
            epoch_offset,
            start: Instant::now(),
        }
    }

    /// Blocks, sleeping and firing one installed wake-up at a time, until no
    /// wake-up remains installed. This is the driver's run loop; nothing
    /// else pumps it.
    pub fn run_until_idle(&self) {
        loop {
            let deadline = self.pending.borrow().as_ref().map(|(d, _)| *d);
            let Some(deadline) = deadline else {
                break;
            };
            let now = self.now();
            let remaining = deadline.duration_since(now);
            if remaining > 0.0 {
                thread::sleep(Duration::from_secs_f64(remaining));
            }
            let wake = self.pending.borrow_mut().take().map(|(_, w)| w);
            if let Some(mut wake) = wake {
                wake();
            }
        }
    }
}

impl TimeDriver<Seconds> for SleepDriver {
    fn now(&self) -> Seconds {
        Seconds(self.epoch_offset + self.start.elapsed().as_secs_f64())
    }

    fn reschedule(&mut self, deadline: Seconds, wake: Wake) {
        *self.pending.borrow_mut() = Some((deadline, wake));
    }

    fn unschedule(&mut self) {
        *self.pending.borrow_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn memory_driver_advance_is_noop_when_idle() {
        let d = MemoryDriver::new(Seconds(0.0));
        d.advance();
        assert_eq!(d.now(), Seconds(0.0));
        assert!(!d.is_scheduled());
    }

    #[test]
    fn memory_driver_advance_fires_and_stops_at_deadline() {
        let mut d = MemoryDriver::new(Seconds(0.0));
        let fired = Rc::new(Cell::new(0u32));
        let fired2 = fired.clone();
        d.reschedule(Seconds(5.0), Box::new(move || fired2.set(fired2.get() + 1)));
        d.advance();
        assert_eq!(d.now(), Seconds(5.0));
        assert_eq!(fired.get(), 1);
        assert!(!d.is_scheduled());
    }

    #[test]
    fn memory_driver_advance_by_fires_due_deadline_then_settles_on_target() {
        let mut d = MemoryDriver::new(Seconds(0.0));
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        d.reschedule(Seconds(1.0), Box::new(move || log2.borrow_mut().push(1)));
        d.advance_by(2.5);
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(d.now(), Seconds(2.5));
        assert!(!d.is_scheduled());
    }

    #[test]
    fn memory_driver_jump_by_fires_once_with_now_already_at_target() {
        let mut d = MemoryDriver::new(Seconds(0.0));
        let seen_now = Rc::new(RefCell::new(None));
        let seen_now2 = seen_now.clone();
        let d2 = d.clone();
        d.reschedule(
            Seconds(1.0),
            Box::new(move || *seen_now2.borrow_mut() = Some(d2.now())),
        );
        d.jump_by(3.2);
        assert_eq!(*seen_now.borrow(), Some(Seconds(3.2)));
        assert_eq!(d.now(), Seconds(3.2));
        assert!(!d.is_scheduled());
    }

    #[test]
    fn memory_driver_jump_by_is_a_noop_fire_when_nothing_due() {
        let d: MemoryDriver<Seconds> = MemoryDriver::new(Seconds(0.0));
        d.jump_by(5.0);
        assert_eq!(d.now(), Seconds(5.0));
        assert!(!d.is_scheduled());
    }

    #[test]
    fn sleep_driver_now_is_monotonic_across_successive_calls() {
        let d = SleepDriver::new();
        let mut previous = d.now();
        for _ in 0..1000 {
            let current = d.now();
            assert!(current >= previous);
            previous = current;
        }
    }
}
