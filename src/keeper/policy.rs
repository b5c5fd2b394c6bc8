use std::{sync::Arc, time::Duration};

use crate::{
    context::SimContext,
    kernel::KernelView,
    sync::{async_event::CrossThreadEvent, rendezvous::Rendezvous},
    SimTime,
};

/// Inputs every policy computes its budget from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    pub kernel_time: SimTime,
    /// Absolute time of the worker: last sync point plus the uncommitted offset.
    pub local_time: SimTime,
    pub quantum: SimTime,
    pub running: bool,
}

/// How far a worker may run ahead before it has to sync.
pub trait SyncPolicy {
    fn time_to_sync(&self, horizon: &Horizon) -> SimTime;

    fn need_sync(&self, horizon: &Horizon) -> bool {
        self.time_to_sync(horizon).is_zero()
    }
}

/// At most one quantum past the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundedQuantum;

impl SyncPolicy for BoundedQuantum {
    fn time_to_sync(&self, h: &Horizon) -> SimTime {
        if !h.running {
            return SimTime::ZERO;
        }
        (h.kernel_time + h.quantum).saturating_sub(h.local_time)
    }
}

/// Budget shrinks in steps as the worker outruns the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveQuantum;

impl SyncPolicy for AdaptiveQuantum {
    fn time_to_sync(&self, h: &Horizon) -> SimTime {
        if !h.running {
            return SimTime::ZERO;
        }
        let (now, local, q) = (h.kernel_time, h.local_time, h.quantum);
        if local <= now {
            q * 2
        } else if local <= now + q {
            q
        } else if local <= now + q * 2 {
            q.mul_f64(0.5)
        } else {
            SimTime::ZERO
        }
    }
}

/// Always the full quantum; syncing is up to the worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconstrained;

impl SyncPolicy for Unconstrained {
    fn time_to_sync(&self, h: &Horizon) -> SimTime {
        h.quantum
    }

    fn need_sync(&self, _: &Horizon) -> bool {
        false
    }
}

/// Lockstep on explicit `sync` calls only.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeRunning;

impl SyncPolicy for FreeRunning {
    fn time_to_sync(&self, h: &Horizon) -> SimTime {
        if !h.running {
            return SimTime::ZERO;
        }
        let window = h.quantum * 2;
        (h.kernel_time + window)
            .saturating_sub(h.local_time)
            .min(window)
    }

    fn need_sync(&self, _: &Horizon) -> bool {
        false
    }
}

/// Budget up to the kernel's next scheduled activity or the quantum boundary, whichever is first.
///
/// Zero while the kernel has work pending at the current time.
pub fn rolling_budget(h: &Horizon, pending_now: bool, next: Option<SimTime>) -> SimTime {
    if !h.running || pending_now {
        return SimTime::ZERO;
    }
    let boundary = (h.kernel_time + h.quantum).saturating_sub(h.local_time);
    match next {
        Some(next) => next.min(boundary),
        None => boundary,
    }
}

/// Budget bounded by the kernel's actual next activity.
///
/// On the kernel thread the budget comes straight from the published clock.
/// Workers ask the kernel through a rendezvous and block for the answer.
pub struct Rolling {
    ask: CrossThreadEvent,
    mailbox: Arc<Rendezvous>,
    ctx: Arc<SimContext>,
    watchdog: Duration,
}

impl Rolling {
    pub(crate) fn new(
        ask: CrossThreadEvent,
        mailbox: Arc<Rendezvous>,
        ctx: Arc<SimContext>,
        watchdog: Duration,
    ) -> Self {
        Self {
            ask,
            mailbox,
            ctx,
            watchdog,
        }
    }
}

impl SyncPolicy for Rolling {
    fn time_to_sync(&self, h: &Horizon) -> SimTime {
        if !h.running {
            return SimTime::ZERO;
        }
        if self.ctx.is_kernel_thread() {
            let clock = self.ctx.clock();
            return rolling_budget(
                h,
                clock.kernel_activity_pending_now(),
                clock.time_to_next_kernel_activity(),
            );
        }
        self.mailbox.request(&self.ask, h.local_time, self.watchdog)
    }
}

pub(crate) enum Policy {
    Bounded(BoundedQuantum),
    Adaptive(AdaptiveQuantum),
    Rolling(Rolling),
    Unconstrained(Unconstrained),
    FreeRunning(FreeRunning),
}

impl Policy {
    fn as_dyn(&self) -> &dyn SyncPolicy {
        match self {
            Policy::Bounded(p) => p,
            Policy::Adaptive(p) => p,
            Policy::Rolling(p) => p,
            Policy::Unconstrained(p) => p,
            Policy::FreeRunning(p) => p,
        }
    }
}

impl SyncPolicy for Policy {
    fn time_to_sync(&self, horizon: &Horizon) -> SimTime {
        self.as_dyn().time_to_sync(horizon)
    }

    fn need_sync(&self, horizon: &Horizon) -> bool {
        self.as_dyn().need_sync(horizon)
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;

    fn horizon(kernel_us: u64, local_us: u64) -> Horizon {
        Horizon {
            kernel_time: SimTime::from_us(kernel_us),
            local_time: SimTime::from_us(local_us),
            quantum: SimTime::from_ms(1),
            running: true,
        }
    }

    #[test]
    fn test_bounded_quantum_budget() {
        assert_eq!(BoundedQuantum.time_to_sync(&horizon(0, 0)), SimTime::from_ms(1));
        assert_eq!(
            BoundedQuantum.time_to_sync(&horizon(0, 100)),
            SimTime::from_us(900)
        );
        assert_eq!(BoundedQuantum.time_to_sync(&horizon(0, 1500)), SimTime::ZERO);
        assert!(BoundedQuantum.need_sync(&horizon(0, 1000)));
        // a lagging worker may catch up to the boundary in one go
        assert_eq!(
            BoundedQuantum.time_to_sync(&horizon(5000, 0)),
            SimTime::from_ms(6)
        );
    }

    #[test]
    fn test_adaptive_tiers() {
        assert_eq!(AdaptiveQuantum.time_to_sync(&horizon(100, 0)), SimTime::from_ms(2));
        assert_eq!(AdaptiveQuantum.time_to_sync(&horizon(0, 0)), SimTime::from_ms(2));
        assert_eq!(AdaptiveQuantum.time_to_sync(&horizon(0, 1000)), SimTime::from_ms(1));
        assert_eq!(
            AdaptiveQuantum.time_to_sync(&horizon(0, 2000)),
            SimTime::from_us(500)
        );
        assert_eq!(AdaptiveQuantum.time_to_sync(&horizon(0, 2001)), SimTime::ZERO);
    }

    #[test]
    fn test_rolling_budget_follows_next_activity() {
        let h = horizon(0, 0);
        assert_eq!(rolling_budget(&h, true, None), SimTime::ZERO);
        assert_eq!(rolling_budget(&h, false, None), SimTime::from_ms(1));
        assert_eq!(
            rolling_budget(&h, false, Some(SimTime::from_us(300))),
            SimTime::from_us(300)
        );
        assert_eq!(
            rolling_budget(&horizon(0, 800), false, Some(SimTime::from_us(300))),
            SimTime::from_us(200)
        );
        assert_eq!(
            rolling_budget(&horizon(5000, 0), false, None),
            SimTime::from_ms(6)
        );
    }

    #[test]
    fn test_unconstrained_and_freerunning_never_demand_sync() {
        let far = horizon(0, 50_000);
        assert_eq!(Unconstrained.time_to_sync(&far), SimTime::from_ms(1));
        assert!(!Unconstrained.need_sync(&far));
        assert_eq!(FreeRunning.time_to_sync(&far), SimTime::ZERO);
        assert!(!FreeRunning.need_sync(&far));
        assert_eq!(FreeRunning.time_to_sync(&horizon(0, 500)), SimTime::from_us(1500));
    }

    #[test]
    fn test_budgets_stay_within_two_quanta() {
        let policies: [&dyn SyncPolicy; 4] =
            [&BoundedQuantum, &AdaptiveQuantum, &Unconstrained, &FreeRunning];
        for kernel in [0, 250, 1000, 7000] {
            for local in [0, 10, 999, 1000, 1001, 2500, 9000] {
                // lagging workers are owed the gap on top
                if local < kernel {
                    continue;
                }
                let h = horizon(kernel, local);
                for policy in policies {
                    assert!(policy.time_to_sync(&h) <= h.quantum * 2);
                }
                for next in [None, Some(SimTime::ZERO), Some(SimTime::from_ms(4))] {
                    assert!(rolling_budget(&h, false, next) <= h.quantum * 2);
                }
            }
        }
    }

    #[test]
    fn test_stopped_horizon_gives_zero() {
        let h = Horizon {
            running: false,
            ..horizon(0, 0)
        };
        assert_eq!(BoundedQuantum.time_to_sync(&h), SimTime::ZERO);
        assert_eq!(AdaptiveQuantum.time_to_sync(&h), SimTime::ZERO);
        assert_eq!(rolling_budget(&h, false, None), SimTime::ZERO);
    }
}
