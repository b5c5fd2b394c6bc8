use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, trace};

use crate::{
    context::SimContext, kernel::Scheduler, sync::async_event::CrossThreadEvent, SimTime,
    SyncError,
};

struct LimiterShared {
    ctx: Arc<SimContext>,
    tick: CrossThreadEvent,
    running: AtomicBool,
    holding: AtomicBool,
    /// Kernel time the wall clock currently allows, in picoseconds.
    runto: AtomicU64,
    slice: Duration,
}

impl LimiterShared {
    fn on_tick(&self, sched: &mut Scheduler) {
        let registry = self.ctx.registry();
        if !self.running.load(Ordering::Acquire) {
            self.tick.detach_suspending();
            if self.holding.swap(false, Ordering::AcqRel) {
                registry.unsuspend_all();
            }
            return;
        }
        let runto = SimTime::from_ps(self.runto.load(Ordering::Acquire));
        let now = sched.now();
        if now >= runto {
            trace!("{now}: ahead of wall clock, holding");
            self.tick.attach_suspending();
            if !self.holding.swap(true, Ordering::AcqRel) {
                registry.suspend_all();
            }
        } else {
            let next = runto + SimTime::from(self.slice / 2);
            sched.notify(self.tick.event(), next - now);
            self.tick.detach_suspending();
            if self.holding.swap(false, Ordering::AcqRel) {
                registry.unsuspend_all();
            }
        }
    }
}

/// Keeps simulated time from running ahead of wall-clock time.
///
/// A background ticker publishes how far the kernel may go every `slice`;
/// the kernel is suspended whenever it reaches that horizon.
pub struct RealtimeLimiter {
    shared: Arc<LimiterShared>,
    ticker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl RealtimeLimiter {
    pub fn new(sched: &mut Scheduler, slice: Duration) -> Result<Self, SyncError> {
        if slice.is_zero() {
            return Err(SyncError::ConfigError(
                "Realtime slice must be positive".to_string(),
            ));
        }
        let tick = CrossThreadEvent::new(sched, "realtime.tick", false);
        let shared = Arc::new(LimiterShared {
            ctx: Arc::clone(sched.context()),
            tick: tick.clone(),
            running: AtomicBool::new(false),
            holding: AtomicBool::new(false),
            runto: AtomicU64::new(0),
            slice,
        });
        let handler = Arc::clone(&shared);
        sched.spawn_method("realtime.tick", &[tick.event()], false, move |s| {
            handler.on_tick(s)
        });
        Ok(Self {
            shared,
            ticker: Mutex::new(None),
        })
    }

    /// Start pacing from the current kernel time.
    pub fn enable(&self) -> Result<(), SyncError> {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyRunning("realtime-limiter".to_string()));
        }
        let start_sim = shared.ctx.clock().now();
        let start_wall = Instant::now();
        shared.runto.store(
            (start_sim + SimTime::from(shared.slice)).as_ps(),
            Ordering::Release,
        );
        shared.tick.notify();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let ticker = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("realtime-ticker".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(ticker.slice) {
                    Err(RecvTimeoutError::Timeout) => {
                        let runto = start_sim + SimTime::from(start_wall.elapsed());
                        ticker.runto.store(runto.as_ps(), Ordering::Release);
                        ticker.tick.notify();
                    }
                    _ => break,
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                shared.running.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        debug!("realtime limiter enabled at {start_sim}");
        *self.ticker.lock().unwrap_or_else(PoisonError::into_inner) = Some((stop_tx, handle));
        Ok(())
    }

    /// Stop pacing. The kernel drops its hold the next time it runs.
    pub fn disable(&self) -> Result<(), SyncError> {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.tick.notify();
        if let Some((stop_tx, handle)) = ticker {
            drop(stop_tx);
            handle.join().map_err(|_| SyncError::ThreadPanic)?;
        }
        debug!("realtime limiter disabled");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// True while the kernel is held back waiting for the wall clock.
    pub fn is_holding(&self) -> bool {
        self.shared.holding.load(Ordering::Acquire)
    }
}

impl Drop for RealtimeLimiter {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}

#[cfg(test)]
mod realtime_limiter_tests {
    use super::*;
    use crate::RunOutcome;

    #[test]
    fn test_kernel_paced_by_wall_clock() {
        let mut sched = Scheduler::new();
        let limiter = RealtimeLimiter::new(&mut sched, Duration::from_millis(10)).unwrap();
        limiter.enable().unwrap();
        assert!(matches!(
            limiter.enable(),
            Err(SyncError::AlreadyRunning(_))
        ));
        let started = Instant::now();
        assert_eq!(
            sched.run_until(SimTime::from_ms(30)).unwrap(),
            RunOutcome::LimitReached
        );
        assert!(started.elapsed() >= Duration::from_millis(20));

        limiter.disable().unwrap();
        assert!(!limiter.is_running());
        sched.run_for(SimTime::from_ms(1)).unwrap();
        assert!(!limiter.is_holding());
        assert!(sched.context().registry().may_idle());
    }

    #[test]
    fn test_zero_slice_rejected() {
        let mut sched = Scheduler::new();
        assert!(RealtimeLimiter::new(&mut sched, Duration::ZERO).is_err());
    }
}
