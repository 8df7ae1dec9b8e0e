//! Branches: a child [`Scheduler`] whose `now()` is a linear function of its
//! parent's, with a [`BranchManager`] control surface for pause/unpause and
//! scale changes.
//!
//! The branch owns no real [`TimeDriver`] of its own. It owns a synthetic
//! one ([`BranchDriver`]) that converts branch-local deadlines into trunk
//! deadlines and installs a single trunk-level call (the "trampoline") that,
//! when it fires, drives the branch scheduler's own fire routine. Concretized
//! to `Box<dyn FnMut()>` work, the same concretization
//! [`repeatedly`](crate::repeater::repeatedly) uses, since the trampoline
//! itself has to be schedulable as ordinary trunk work.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::driver::{TimeDriver, Wake};
use crate::error::FritterError;
use crate::scheduler::{FutureCall, Scheduler};
use crate::time::TimeValue;

type TrunkWork = Box<dyn FnMut()>;

struct Shared<T: TimeValue, D: TimeDriver<T>> {
    trunk: Scheduler<T, D, TrunkWork>,
    anchor_trunk: T,
    anchor_branch: T,
    scale: f64,
    scale_saved: f64,
    paused: bool,
    // The branch scheduler's own queue head, as last reported to this
    // driver via `reschedule`/`unschedule`. Recalibration (pause, unpause,
    // change_scale) re-derives a fresh trunk deadline from this instead of
    // reaching back into the branch scheduler's queue directly.
    pending: Option<(T, Wake)>,
    trampoline: Option<FutureCall<T, D, TrunkWork>>,
}

impl<T: TimeValue, D: TimeDriver<T>> Shared<T, D> {
    fn branch_now_at(&self, t_trunk: T) -> T {
        let elapsed = t_trunk.duration_since(self.anchor_trunk);
        self.anchor_branch
            .add_duration(T::scale_duration(elapsed, self.scale))
    }

    fn trunk_deadline_for(&self, branch_deadline: T) -> T {
        let branch_elapsed = branch_deadline.duration_since(self.anchor_branch);
        self.anchor_trunk
            .add_duration(T::scale_duration(branch_elapsed, 1.0 / self.scale))
    }

    /// Cancels whatever trampoline is currently installed (a no-op if none
    /// is), without touching `pending`.
    fn cancel_trampoline(&mut self) {
        if let Some(handle) = self.trampoline.take() {
            handle.cancel();
        }
    }

    /// Installs a fresh trunk-level trampoline for `pending`'s deadline, if
    /// there is one and the branch isn't paused. Exactly one trampoline
    /// exists at a time: any previous one is canceled first.
    fn rearm(shared_rc: &Rc<RefCell<Self>>) {
        let mut shared = shared_rc.borrow_mut();
        shared.cancel_trampoline();
        if shared.paused {
            return;
        }
        let Some((branch_deadline, _)) = &shared.pending else {
            return;
        };
        let trunk_deadline = shared.trunk_deadline_for(*branch_deadline);
        let weak = Rc::downgrade(shared_rc);
        let trunk = shared.trunk.clone();
        drop(shared);
        let handle = trunk.call_at(
            trunk_deadline,
            Box::new(move || {
                let Some(strong) = weak.upgrade() else {
                    return;
                };
                let wake = strong.borrow_mut().pending.take().map(|(_, w)| w);
                if let Some(mut wake) = wake {
                    wake();
                }
            }),
        );
        shared_rc.borrow_mut().trampoline = Some(handle);
    }
}

/// The branch's synthetic [`TimeDriver`]: `now()` applies the linear
/// transform, `reschedule`/`unschedule` convert to/from trunk deadlines and
/// install/cancel the trunk-level trampoline.
pub struct BranchDriver<T: TimeValue, D: TimeDriver<T>> {
    shared: Rc<RefCell<Shared<T, D>>>,
}

impl<T: TimeValue, D: TimeDriver<T>> Clone for BranchDriver<T, D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: TimeValue, D: TimeDriver<T>> TimeDriver<T> for BranchDriver<T, D> {
    fn now(&self) -> T {
        let shared = self.shared.borrow();
        let t_trunk = shared.trunk.now();
        shared.branch_now_at(t_trunk)
    }

    fn reschedule(&mut self, deadline: T, wake: Wake) {
        self.shared.borrow_mut().pending = Some((deadline, wake));
        Shared::rearm(&self.shared);
    }

    fn unschedule(&mut self) {
        let mut shared = self.shared.borrow_mut();
        shared.pending = None;
        shared.cancel_trampoline();
    }
}

/// The control surface for a branch: pause, unpause, and scale changes, all
/// preserving continuity of `now()` across the state change.
pub struct BranchManager<T: TimeValue, D: TimeDriver<T>> {
    shared: Rc<RefCell<Shared<T, D>>>,
}

impl<T: TimeValue, D: TimeDriver<T>> Clone for BranchManager<T, D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: TimeValue, D: TimeDriver<T>> BranchManager<T, D> {
    /// The branch's current time, per the linear transform.
    pub fn now(&self) -> T {
        let shared = self.shared.borrow();
        let t_trunk = shared.trunk.now();
        shared.branch_now_at(t_trunk)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.borrow().paused
    }

    pub fn scale(&self) -> f64 {
        let shared = self.shared.borrow();
        if shared.paused {
            shared.scale_saved
        } else {
            shared.scale
        }
    }

    /// Freezes the branch clock at its current value. A no-op if already
    /// paused. The trampoline is canceled; no branch work fires until
    /// [`unpause`](Self::unpause).
    pub fn pause(&self) {
        let mut shared = self.shared.borrow_mut();
        if shared.paused {
            return;
        }
        let t_trunk = shared.trunk.now();
        let frozen = shared.branch_now_at(t_trunk);
        shared.scale_saved = shared.scale;
        shared.anchor_trunk = t_trunk;
        shared.anchor_branch = frozen;
        shared.scale = 0.0;
        shared.paused = true;
        shared.cancel_trampoline();
        trace!(?frozen, "branch paused");
    }

    /// Resumes a paused branch, restoring its pre-pause scale and
    /// re-arming the trampoline from the branch's queue head. A no-op if
    /// not paused.
    pub fn unpause(&self) {
        let paused = self.shared.borrow().paused;
        if !paused {
            return;
        }
        {
            let mut shared = self.shared.borrow_mut();
            let t_trunk = shared.trunk.now();
            let frozen = shared.anchor_branch; // constant while paused
            shared.anchor_trunk = t_trunk;
            shared.anchor_branch = frozen;
            shared.scale = shared.scale_saved;
            shared.paused = false;
        }
        Shared::rearm(&self.shared);
        trace!("branch unpaused");
    }

    /// Changes the branch's time-scale factor, recalibrating anchors so
    /// `now()` is unaffected by the change. `new_scale` must be finite and
    /// strictly positive — `change_scale(0)` is rejected; [`pause`](Self::pause)
    /// is the only legitimate path to a stopped branch clock (spec.md §9).
    pub fn change_scale(&self, new_scale: f64) -> Result<(), FritterError> {
        if !new_scale.is_finite() || new_scale <= 0.0 {
            return Err(FritterError::InvalidScale(new_scale));
        }
        let paused = {
            let mut shared = self.shared.borrow_mut();
            let t_trunk = shared.trunk.now();
            let frozen = shared.branch_now_at(t_trunk);
            shared.anchor_trunk = t_trunk;
            shared.anchor_branch = frozen;
            if shared.paused {
                shared.scale_saved = new_scale;
            } else {
                shared.scale = new_scale;
            }
            shared.paused
        };
        if !paused {
            Shared::rearm(&self.shared);
        }
        trace!(new_scale, "branch scale changed");
        Ok(())
    }
}

/// Creates a branch: a child [`Scheduler`] whose time is `offset + (trunk
/// time elapsed) * scale`, plus the [`BranchManager`] that controls it.
///
/// `scale` must be finite and strictly positive (the same constraint
/// [`BranchManager::change_scale`] enforces). `trunk` may itself be a
/// branched scheduler — transforms compose, nesting depth is bounded only
/// by host memory.
pub fn branch<T, D>(
    trunk: &Scheduler<T, D, TrunkWork>,
    scale: f64,
    offset: T,
) -> Result<(BranchManager<T, D>, Scheduler<T, BranchDriver<T, D>, TrunkWork>), FritterError>
where
    T: TimeValue + 'static,
    D: TimeDriver<T> + 'static,
{
    if !scale.is_finite() || scale <= 0.0 {
        return Err(FritterError::InvalidScale(scale));
    }
    let shared = Rc::new(RefCell::new(Shared {
        trunk: trunk.clone(),
        anchor_trunk: trunk.now(),
        anchor_branch: offset,
        scale,
        scale_saved: scale,
        paused: false,
        pending: None,
        trampoline: None,
    }));
    let driver = BranchDriver {
        shared: shared.clone(),
    };
    let branch_scheduler = Scheduler::new(driver);
    let manager = BranchManager { shared };
    Ok((manager, branch_scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::time::Seconds;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn log_push(log: &StdRc<StdRefCell<Vec<String>>>, label: &'static str) -> TrunkWork {
        let log = log.clone();
        Box::new(move || log.borrow_mut().push(label.to_string()))
    }

    #[test]
    fn s5_branch_pause_resume() {
        let driver = MemoryDriver::new(Seconds(0.0));
        let trunk: Scheduler<Seconds, MemoryDriver<Seconds>, TrunkWork> =
            Scheduler::new(driver.clone());
        let (mgr, b) = branch(&trunk, 1.0, Seconds(0.0)).unwrap();
        let log = StdRc::new(StdRefCell::new(Vec::new()));

        b.call_at(Seconds(1.0), log_push(&log, "X"));
        b.call_at(Seconds(2.0), log_push(&log, "Y"));
        b.call_at(Seconds(3.0), log_push(&log, "Z"));
        trunk.call_at(Seconds(1.0), log_push(&log, "P"));
        trunk.call_at(Seconds(2.0), log_push(&log, "Q"));
        trunk.call_at(Seconds(3.0), log_push(&log, "R"));

        driver.advance();
        assert_eq!(*log.borrow(), vec!["X".to_string(), "P".to_string()]);
        assert_eq!(driver.now(), Seconds(1.0));

        mgr.pause();
        driver.advance();
        assert_eq!(
            *log.borrow(),
            vec!["X".to_string(), "P".to_string(), "Q".to_string()]
        );
        assert_eq!(driver.now(), Seconds(2.0));
        assert_eq!(mgr.now(), Seconds(1.0));

        mgr.unpause();
        driver.advance();
        assert_eq!(
            *log.borrow(),
            vec![
                "X".to_string(),
                "P".to_string(),
                "Q".to_string(),
                "R".to_string(),
                "Y".to_string()
            ]
        );
        assert_eq!(driver.now(), Seconds(3.0));

        driver.advance();
        assert_eq!(
            *log.borrow(),
            vec![
                "X".to_string(),
                "P".to_string(),
                "Q".to_string(),
                "R".to_string(),
                "Y".to_string(),
                "Z".to_string()
            ]
        );
        assert_eq!(driver.now(), Seconds(4.0));
        assert_eq!(mgr.now(), Seconds(3.0));
    }

    #[test]
    fn s6_branch_triple_scale() {
        let driver = MemoryDriver::new(Seconds(0.0));
        let trunk: Scheduler<Seconds, MemoryDriver<Seconds>, TrunkWork> =
            Scheduler::new(driver.clone());
        let (_mgr, b) = branch(&trunk, 3.0, Seconds(0.0)).unwrap();
        let log = StdRc::new(StdRefCell::new(Vec::new()));

        b.call_at(Seconds(1.0), log_push(&log, "A"));
        b.call_at(Seconds(2.0), log_push(&log, "B"));
        b.call_at(Seconds(3.0), log_push(&log, "C"));

        driver.advance();
        assert_eq!(*log.borrow(), vec!["A".to_string()]);
        assert!((driver.now().as_secs() - 1.0 / 3.0).abs() < 1e-9);

        driver.advance();
        assert_eq!(*log.borrow(), vec!["A".to_string(), "B".to_string()]);
        assert!((driver.now().as_secs() - 2.0 / 3.0).abs() < 1e-9);

        driver.advance();
        assert_eq!(
            *log.borrow(),
            vec!["A".to_string(), "B".to_string(), "C".to_string()]
        );
        assert!((driver.now().as_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn branch_continuity_across_pause_unpause_and_scale_change() {
        let driver = MemoryDriver::new(Seconds(0.0));
        let trunk: Scheduler<Seconds, MemoryDriver<Seconds>, TrunkWork> =
            Scheduler::new(driver.clone());
        let (mgr, _b) = branch(&trunk, 2.0, Seconds(0.0)).unwrap();

        driver.advance_by(1.0);
        let before_pause = mgr.now();
        mgr.pause();
        assert_eq!(mgr.now(), before_pause);

        driver.advance_by(1.0);
        let before_unpause = mgr.now();
        mgr.unpause();
        assert_eq!(mgr.now(), before_unpause);

        let before_scale = mgr.now();
        mgr.change_scale(5.0).unwrap();
        assert_eq!(mgr.now(), before_scale);
    }

    #[test]
    fn paused_branch_clock_is_constant_regardless_of_trunk_advancement() {
        let driver = MemoryDriver::new(Seconds(0.0));
        let trunk: Scheduler<Seconds, MemoryDriver<Seconds>, TrunkWork> =
            Scheduler::new(driver.clone());
        let (mgr, b) = branch(&trunk, 1.0, Seconds(0.0)).unwrap();
        let log = StdRc::new(StdRefCell::new(Vec::new()));
        b.call_at(Seconds(5.0), log_push(&log, "never"));

        mgr.pause();
        let frozen = mgr.now();
        driver.advance_by(100.0);
        assert_eq!(mgr.now(), frozen);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn change_scale_rejects_zero_and_negative_and_nan() {
        let driver = MemoryDriver::new(Seconds(0.0));
        let trunk: Scheduler<Seconds, MemoryDriver<Seconds>, TrunkWork> =
            Scheduler::new(driver);
        let (mgr, _b) = branch(&trunk, 1.0, Seconds(0.0)).unwrap();
        assert!(mgr.change_scale(0.0).is_err());
        assert!(mgr.change_scale(-1.0).is_err());
        assert!(mgr.change_scale(f64::NAN).is_err());
        assert!(mgr.change_scale(2.0).is_ok());
    }

    #[test]
    fn branch_factory_rejects_non_positive_scale() {
        let driver = MemoryDriver::new(Seconds(0.0));
        let trunk: Scheduler<Seconds, MemoryDriver<Seconds>, TrunkWork> =
            Scheduler::new(driver);
        assert!(branch(&trunk, 0.0, Seconds(0.0)).is_err());
        assert!(branch(&trunk, -2.0, Seconds(0.0)).is_err());
    }

    #[test]
    fn nested_branch_composes_transforms() {
        let driver = MemoryDriver::new(Seconds(0.0));
        let trunk: Scheduler<Seconds, MemoryDriver<Seconds>, TrunkWork> =
            Scheduler::new(driver.clone());
        let (_outer_mgr, outer) = branch(&trunk, 2.0, Seconds(0.0)).unwrap();
        let (_inner_mgr, inner) = branch(&outer, 2.0, Seconds(0.0)).unwrap();
        let log = StdRc::new(StdRefCell::new(Vec::new()));
        inner.call_at(Seconds(4.0), log_push(&log, "inner"));

        // inner runs 2x outer, outer runs 2x trunk: inner=4 -> outer=2 -> trunk=1.
        driver.advance();
        assert_eq!(*log.borrow(), vec!["inner".to_string()]);
        assert!((driver.now().as_secs() - 1.0).abs() < 1e-9);
    }
}
