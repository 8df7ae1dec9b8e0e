//! The crate's only fallible-return error type.
//!
//! Most of the error kinds spec.md §7 names are *tolerated*, not returned:
//! `CancelAfterFire`/`DoubleCancel` are silent no-ops, `ScheduleInPast` is
//! clamped rather than rejected, and `DriverMisbehavior` is absorbed by the
//! repeater's step-count mechanism. `WorkFailure` is a panic and is never
//! converted into a `Result` — it escapes the fire routine by design (see
//! [`Scheduler`](crate::scheduler::Scheduler)). What remains is genuinely
//! synchronous, caller-facing misuse.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FritterError {
    /// A non-finite or non-positive scale factor was passed to
    /// `BranchManager::change_scale`, or a `RecurrenceRule` computed a
    /// boundary at or before its `after` argument instead of strictly past
    /// it (the §9 "zero-length recurrence" open question, resolved here as
    /// an error rather than an infinite loop).
    #[error("invalid scale or non-advancing recurrence: {0}")]
    InvalidScale(f64),

    /// A `RecurrenceRule` implementation violated its own contract by
    /// returning a boundary that does not strictly advance past `after`.
    /// Surfaced to callers of `repeatedly` instead of looping or panicking.
    #[error("recurrence rule did not advance past {0:?}")]
    UnknownRecurrence(String),
}
