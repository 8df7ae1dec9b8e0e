//! Fritter: a single-threaded scheduler for future work against an abstract
//! clock, with pausable/rescalable time-transformed branches.
//!
//! The core is generic over a time value `T` ([`time::TimeValue`]) and a
//! work callable `W` ([`work::Invocable`]). [`scheduler::Scheduler`] owns a
//! [`driver::TimeDriver`] and a [`queue::PriorityQueue`] of pending calls;
//! [`repeater::repeatedly`] builds a drift-free recurring call on top of it;
//! [`branch::branch`] builds a time-scaled child scheduler on top of it.
//! [`driver::MemoryDriver`] and [`driver::SleepDriver`] are the two shipped
//! `TimeDriver`s — binding to a real event loop is left to a downstream
//! adapter crate.

pub mod branch;
pub mod driver;
pub mod error;
pub mod persist;
pub mod queue;
pub mod repeater;
pub mod rule;
pub mod scheduler;
pub mod time;
pub mod work;

pub use branch::{branch as new_branch, BranchDriver, BranchManager};
pub use driver::{MemoryDriver, SleepDriver, TimeDriver, Wake};
pub use error::FritterError;
pub use persist::{export_calls, Decoder, PersistValue, PersistableWork, PersistedCall};
pub use queue::{BinaryHeapQueue, PriorityQueue};
pub use repeater::{repeatedly, Stopper};
pub use rule::{CivilClock, CivilRule, CivilUnit, FixedIntervalRule, RecurrenceRule, UtcClock};
pub use scheduler::{FutureCall, Scheduler};
pub use time::{Seconds, TimeValue};
pub use work::{Invocable, StepWork};
