//! `RecurrenceRule`: pure computation of the next recurrence boundary and
//! the count of boundaries crossed in an interval.
//!
//! Two implementations ship unconditionally: [`FixedIntervalRule`] ("every N
//! seconds from anchor") and [`CivilRule<UtcClock>`] ("every N civil units",
//! UTC only since UTC has no DST to disambiguate). A real IANA-zone-aware
//! [`CivilClock`] ships behind the `civil-tz` feature as `TzClock`.
//!
//! Design note on `steps_between`'s missing `reference` parameter (spec.md
//! §4.5 gives `next` a `reference` but not `steps_between`): every caller in
//! this crate only ever passes an `earlier` that is itself already a
//! boundary (the recurrence's `reference` anchor, or a value this same rule
//! previously returned from `next`/`steps_between`). Counting boundaries in
//! `(earlier, later]` is then reference-independent — it only depends on
//! the spacing between grid points, not where the grid starts — so the
//! contract holds without threading `reference` through a second call.
//! [`repeatedly`](crate::repeater::repeatedly) maintains that invariant;
//! see DESIGN.md.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};

use crate::time::Seconds;

/// `next` returns the smallest boundary strictly greater than `after`;
/// `steps_between` counts boundaries in `(earlier, later]`. Both must be
/// pure and deterministic — `Repeater` calls them from inside a fire pass
/// and assumes no side effects.
pub trait RecurrenceRule<T> {
    fn next(&self, after: T, reference: T) -> T;
    fn steps_between(&self, earlier: T, later: T) -> u64;

    /// Whether this rule's parameters can ever produce an advancing
    /// boundary. Checked by
    /// [`repeatedly`](crate::repeater::repeatedly) before scheduling
    /// anything, per spec.md §9's "zero-length recurrence" resolution.
    /// Defaults to `true`; the two built-in rules override it to reject a
    /// non-positive period or unit count.
    fn is_valid(&self) -> bool {
        true
    }
}

const EPSILON: f64 = 1e-9;

/// `every(p)`: `next(a, r) = r + p*ceil((a-r)/p)`, with the convention that
/// a boundary exactly on a multiple of `p` advances to the *next* one,
/// never returning `a` itself.
#[derive(Debug, Clone, Copy)]
pub struct FixedIntervalRule {
    period: f64,
}

impl FixedIntervalRule {
    /// `period` must be finite and strictly positive. A non-positive or
    /// non-finite period would make every boundary computation
    /// non-advancing; rejected where it's first used
    /// ([`repeatedly`](crate::repeater::repeatedly), via
    /// [`RecurrenceRule::is_valid`]) rather than here, since constructing
    /// the rule is pure arithmetic setup.
    pub fn every(period: f64) -> Self {
        Self { period }
    }

    pub fn period(&self) -> f64 {
        self.period
    }
}

impl RecurrenceRule<Seconds> for FixedIntervalRule {
    fn is_valid(&self) -> bool {
        self.period.is_finite() && self.period > 0.0
    }

    fn next(&self, after: Seconds, reference: Seconds) -> Seconds {
        let elapsed = after.as_secs() - reference.as_secs();
        // k is the boundary index at or before `after`; always step to
        // k+1 so the result is strictly greater than `after`, even when
        // `after` lands exactly on a boundary.
        let k = ((elapsed / self.period) + EPSILON).floor();
        Seconds::from_secs(reference.as_secs() + (k + 1.0) * self.period)
    }

    fn steps_between(&self, earlier: Seconds, later: Seconds) -> u64 {
        let gap = later.as_secs() - earlier.as_secs();
        let steps = (gap / self.period + EPSILON).floor();
        steps.max(0.0) as u64
    }
}

/// The civil unit a [`CivilRule`] recurs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CivilUnit {
    Weekly,
    Monthly,
    Yearly,
}

/// The adapter a [`CivilRule`] needs: where a civil unit starts, and how to
/// step forward by whole units, resolving DST ambiguity per spec.md §4.5
/// ("gap → the instant just after the gap; overlap → the earlier
/// instant"). Kept deliberately small — a full zoneinfo database is a
/// downstream concern (spec.md §1's civil-time non-goal); this is only the
/// two operations `CivilRule` needs from one.
pub trait CivilClock {
    /// The start of the civil unit containing `instant`.
    fn start_of(&self, instant: Seconds, unit: CivilUnit) -> Seconds;

    /// `start` stepped forward by `n` whole units (`n` may be 0).
    fn add_units(&self, start: Seconds, unit: CivilUnit, n: i64) -> Seconds;
}

/// Every boundary computed over UTC civil calendar units. UTC has no DST,
/// so disambiguation never applies — every instant maps to exactly one
/// civil moment.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtcClock;

fn to_utc(instant: Seconds) -> DateTime<Utc> {
    Utc.timestamp_opt(
        instant.as_secs().floor() as i64,
        ((instant.as_secs().fract() * 1e9).round() as u32).min(999_999_999),
    )
    .single()
    .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

fn from_utc(dt: DateTime<Utc>) -> Seconds {
    Seconds::from_secs(dt.timestamp() as f64 + dt.timestamp_subsec_nanos() as f64 / 1e9)
}

fn start_of_week(dt: DateTime<Utc>) -> DateTime<Utc> {
    let days_since_monday = dt.weekday().num_days_from_monday();
    (dt - ChronoDuration::days(days_since_monday as i64))
        .with_hour(0)
        .and_then(|d| d.with_minute(0))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

fn start_of_month(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(dt)
}

fn start_of_year(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(dt.year(), 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(dt)
}

impl CivilClock for UtcClock {
    fn start_of(&self, instant: Seconds, unit: CivilUnit) -> Seconds {
        let dt = to_utc(instant);
        from_utc(match unit {
            CivilUnit::Weekly => start_of_week(dt),
            CivilUnit::Monthly => start_of_month(dt),
            CivilUnit::Yearly => start_of_year(dt),
        })
    }

    fn add_units(&self, start: Seconds, unit: CivilUnit, n: i64) -> Seconds {
        let dt = to_utc(start);
        let stepped = match unit {
            CivilUnit::Weekly => dt + ChronoDuration::weeks(n),
            CivilUnit::Monthly => add_months(dt, n),
            CivilUnit::Yearly => add_months(dt, n * 12),
        };
        from_utc(stepped)
    }
}

fn add_months(dt: DateTime<Utc>, n: i64) -> DateTime<Utc> {
    let total_months = dt.year() as i64 * 12 + (dt.month() as i64 - 1) + n;
    let year = total_months.div_euclid(12) as i32;
    let month = (total_months.rem_euclid(12) + 1) as u32;
    Utc.with_ymd_and_hms(
        year,
        month,
        1,
        dt.hour(),
        dt.minute(),
        dt.second(),
    )
    .single()
    .unwrap_or(dt)
}

/// Recurs every N civil units (weekly/monthly/yearly) as resolved by a
/// [`CivilClock`]. Generic over the clock so the zoneless [`UtcClock`] and
/// the `civil-tz`-gated IANA-zone clock share one implementation.
#[derive(Debug, Clone, Copy)]
pub struct CivilRule<Z: CivilClock> {
    clock: Z,
    unit: CivilUnit,
    count: i64,
}

impl<Z: CivilClock> CivilRule<Z> {
    pub fn new(clock: Z, unit: CivilUnit, count: i64) -> Self {
        Self { clock, unit, count }
    }
}

impl<Z: CivilClock> RecurrenceRule<Seconds> for CivilRule<Z> {
    fn is_valid(&self) -> bool {
        self.count > 0
    }

    fn next(&self, after: Seconds, reference: Seconds) -> Seconds {
        let start = self.clock.start_of(reference, self.unit);
        // Binary-search-free linear walk: civil boundary counts per call
        // are small in practice (a recurrence that's already thousands of
        // units stale has bigger problems than this loop's cost).
        let mut k: i64 = 0;
        loop {
            let candidate = self.clock.add_units(start, self.unit, k * self.count);
            if candidate > after {
                return candidate;
            }
            k += 1;
        }
    }

    fn steps_between(&self, earlier: Seconds, later: Seconds) -> u64 {
        // `earlier` is itself a grid point (see module doc); walk forward
        // in units of `self.count` until exceeding `later`.
        let mut steps: u64 = 0;
        let mut cursor = earlier;
        loop {
            let candidate = self.clock.add_units(cursor, self.unit, self.count);
            if candidate > later {
                return steps;
            }
            steps += 1;
            cursor = candidate;
        }
    }
}

#[cfg(feature = "civil-tz")]
pub mod tz {
    //! A real IANA-zone-aware [`CivilClock`], gated behind `civil-tz`.
    use super::*;
    use chrono::LocalResult;
    use chrono_tz::Tz;

    /// Resolves civil boundaries in a named IANA zone. DST ambiguity is
    /// resolved exactly as spec.md §4.5 mandates: a boundary that falls in
    /// a spring-forward gap resolves to the instant just after the gap; a
    /// boundary that falls in a fall-back overlap resolves to the earlier
    /// of the two instants — which is precisely what `chrono`'s own
    /// `LocalResult::Single`/`None`/`Ambiguous(earliest, _)` already
    /// distinguish.
    #[derive(Debug, Clone, Copy)]
    pub struct TzClock(pub Tz);

    impl CivilClock for TzClock {
        fn start_of(&self, instant: Seconds, unit: CivilUnit) -> Seconds {
            let utc = to_utc(instant);
            let local = utc.with_timezone(&self.0);
            let civil_start = match unit {
                CivilUnit::Weekly => {
                    let days = local.weekday().num_days_from_monday();
                    local.date_naive() - ChronoDuration::days(days as i64)
                }
                CivilUnit::Monthly => {
                    local.date_naive().with_day(1).unwrap_or(local.date_naive())
                }
                CivilUnit::Yearly => local
                    .date_naive()
                    .with_month(1)
                    .and_then(|d| d.with_day(1))
                    .unwrap_or(local.date_naive()),
            };
            let naive_midnight = civil_start.and_hms_opt(0, 0, 0).expect("valid midnight");
            let resolved = match self.0.from_local_datetime(&naive_midnight) {
                LocalResult::Single(dt) => dt,
                LocalResult::Ambiguous(earliest, _) => earliest,
                LocalResult::None => {
                    // Spring-forward gap at midnight: step forward minute by
                    // minute (bounded) until a valid local instant appears.
                    let mut minutes = 0i64;
                    loop {
                        let candidate = naive_midnight + ChronoDuration::minutes(minutes);
                        if let LocalResult::Single(dt) = self.0.from_local_datetime(&candidate) {
                            break dt;
                        }
                        minutes += 1;
                        if minutes > 24 * 60 {
                            break self.0.from_utc_datetime(&naive_midnight);
                        }
                    }
                }
            };
            from_utc(resolved.with_timezone(&Utc))
        }

        fn add_units(&self, start: Seconds, unit: CivilUnit, n: i64) -> Seconds {
            let utc = to_utc(start);
            let local = utc.with_timezone(&self.0);
            let naive = local.naive_local();
            let stepped_naive = match unit {
                CivilUnit::Weekly => naive + ChronoDuration::weeks(n),
                CivilUnit::Monthly => {
                    let dt_utc = add_months(local.with_timezone(&Utc), n);
                    dt_utc.naive_utc()
                }
                CivilUnit::Yearly => {
                    let dt_utc = add_months(local.with_timezone(&Utc), n * 12);
                    dt_utc.naive_utc()
                }
            };
            let resolved = match self.0.from_local_datetime(&stepped_naive) {
                LocalResult::Single(dt) => dt,
                LocalResult::Ambiguous(earliest, _) => earliest,
                LocalResult::None => {
                    let mut minutes = 0i64;
                    loop {
                        let candidate = stepped_naive + ChronoDuration::minutes(minutes);
                        if let LocalResult::Single(dt) = self.0.from_local_datetime(&candidate) {
                            break dt;
                        }
                        minutes += 1;
                        if minutes > 24 * 60 {
                            break self.0.from_utc_datetime(&stepped_naive);
                        }
                    }
                }
            };
            from_utc(resolved.with_timezone(&Utc))
        }
    }

}
