//! The work `W` a [`Scheduler`](crate::scheduler::Scheduler) invokes.
//!
//! Source implementations of this kind of scheduler duck-type "work" as any
//! zero-argument callable; in a typed target we name that capability
//! [`Invocable`] and let the scheduler stay generic over it rather than
//! forcing every caller through a boxed closure up front.

/// A no-argument, no-return callable. Panics escape to the caller of
/// whichever [`TimeDriver`](crate::driver::TimeDriver) wake-up triggered the
/// fire routine — the scheduler never catches them, only guarantees its own
/// bookkeeping stays consistent around the unwind (see
/// [`Scheduler`](crate::scheduler::Scheduler)'s fire routine).
pub trait Invocable {
    fn run(&mut self);
}

impl<F: FnMut()> Invocable for F {
    fn run(&mut self) {
        self()
    }
}

/// The repeating-call variant: receives the drift-free step count and a
/// [`Stopper`](crate::repeater::Stopper) it can trip to end the recurrence.
pub trait StepWork {
    fn run(&mut self, steps: u32, stopper: &crate::repeater::Stopper);
}

impl<F: FnMut(u32, &crate::repeater::Stopper)> StepWork for F {
    fn run(&mut self, steps: u32, stopper: &crate::repeater::Stopper) {
        self(steps, stopper)
    }
}
