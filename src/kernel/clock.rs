use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{kernel::KernelView, SimTime};

const NO_ACTIVITY: u64 = u64::MAX;

/// Kernel state published for other threads.
///
/// Only the kernel writes here. Workers read `now` to compute budgets; the
/// activity fields are only meaningful on the kernel thread itself, where
/// they are as fresh as the last loop iteration.
pub struct KernelClock {
    now: AtomicU64,
    next_activity: AtomicU64,
    pending_now: AtomicBool,
    finished: AtomicBool,
}

impl Default for KernelClock {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelClock {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            next_activity: AtomicU64::new(NO_ACTIVITY),
            pending_now: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn now(&self) -> SimTime {
        SimTime::from_ps(self.now.load(Ordering::Acquire))
    }

    pub(crate) fn set_now(&self, now: SimTime) {
        self.now.store(now.as_ps(), Ordering::Release);
    }

    pub(crate) fn publish(&self, next_activity: Option<SimTime>, pending_now: bool) {
        self.next_activity.store(
            next_activity.map_or(NO_ACTIVITY, SimTime::as_ps),
            Ordering::Release,
        );
        self.pending_now.store(pending_now, Ordering::Release);
    }

    /// Fold a notification raised by a running process into the published snapshot.
    pub(crate) fn note_activity(&self, at: SimTime, pending_now: bool) {
        self.next_activity.fetch_min(at.as_ps(), Ordering::AcqRel);
        if pending_now {
            self.pending_now.store(true, Ordering::Release);
        }
    }

    /// True once the kernel loop has returned because it went quiescent or was stopped.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn set_finished(&self, finished: bool) {
        self.finished.store(finished, Ordering::Release);
    }
}

impl KernelView for KernelClock {
    fn kernel_now(&self) -> SimTime {
        self.now()
    }

    fn time_to_next_kernel_activity(&self) -> Option<SimTime> {
        match self.next_activity.load(Ordering::Acquire) {
            NO_ACTIVITY => None,
            at => Some(SimTime::from_ps(at).saturating_sub(self.now())),
        }
    }

    fn kernel_activity_pending_now(&self) -> bool {
        self.pending_now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod kernel_clock_tests {
    use super::*;

    #[test]
    fn test_published_activity_is_relative_to_now() {
        let clock = KernelClock::new();
        assert_eq!(clock.time_to_next_kernel_activity(), None);
        clock.set_now(SimTime::from_us(10));
        clock.publish(Some(SimTime::from_us(25)), false);
        assert_eq!(clock.kernel_now(), SimTime::from_us(10));
        assert_eq!(
            clock.time_to_next_kernel_activity(),
            Some(SimTime::from_us(15))
        );
        assert!(!clock.kernel_activity_pending_now());
        clock.note_activity(SimTime::from_us(12), false);
        assert_eq!(
            clock.time_to_next_kernel_activity(),
            Some(SimTime::from_us(2))
        );
        clock.publish(None, true);
        assert_eq!(clock.time_to_next_kernel_activity(), None);
        assert!(clock.kernel_activity_pending_now());
    }
}
