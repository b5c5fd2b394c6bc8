use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Condvar, Mutex, PoisonError,
    },
    time::Duration,
};

use log::{debug, trace, warn};

/// Identity of a registered suspending source.
pub type SourceId = u64;

/// Balanced suspend/resume counter plus the set of sources that may still
/// produce work for the kernel.
///
/// The kernel may treat the simulation as quiescent only while the suspend
/// count is zero and no source is attached. It also owns the kernel's park
/// condition: any thread can wake a parked kernel through `async_wakeup`.
pub struct SuspendRegistry {
    suspend: AtomicUsize,
    unsuspendable: AtomicUsize,
    sources: Mutex<Vec<SourceId>>,
    has_sources: AtomicBool,
    next_source: AtomicU64,
    wakeups: Mutex<u64>,
    cond: Condvar,
}

impl Default for SuspendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendRegistry {
    pub fn new() -> Self {
        Self {
            suspend: AtomicUsize::new(0),
            unsuspendable: AtomicUsize::new(0),
            sources: Mutex::new(Vec::new()),
            has_sources: AtomicBool::new(false),
            next_source: AtomicU64::new(1),
            wakeups: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Hold the kernel at its current time. Returns the new suspend count.
    pub fn suspend_all(&self) -> usize {
        let count = self.suspend.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("suspend_all() {count}");
        count
    }

    /// Release one suspension. Extra calls are logged and clamp at zero.
    pub fn unsuspend_all(&self) -> usize {
        match self
            .suspend
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => {
                trace!("unsuspend_all() {}", prev - 1);
                self.async_wakeup();
                prev - 1
            }
            Err(_) => {
                warn!("unsuspend_all() without a matching suspend_all(), count stays at 0");
                0
            }
        }
    }

    pub fn suspend_count(&self) -> usize {
        self.suspend.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_suspended(&self) -> bool {
        self.suspend_count() > 0
    }

    /// Open a section during which time may advance even while suspended.
    pub fn enter_unsuspendable(&self) {
        self.unsuspendable.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave_unsuspendable(&self) {
        if self
            .unsuspendable
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_err()
        {
            warn!("leave_unsuspendable() without a matching enter_unsuspendable()");
        }
        self.async_wakeup();
    }

    pub fn has_unsuspendable(&self) -> bool {
        self.unsuspendable.load(Ordering::Acquire) > 0
    }

    pub fn new_source_id(&self) -> SourceId {
        self.next_source.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a source the kernel must keep waiting on. Returns false if it was already attached.
    pub fn attach_suspending(&self, source: SourceId) -> bool {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        if sources.contains(&source) {
            return false;
        }
        sources.push(source);
        self.has_sources.store(true, Ordering::Release);
        debug!("attach_suspending({source}) {}", sources.len());
        true
    }

    /// Unregister a source. Returns false if it was not attached.
    pub fn detach_suspending(&self, source: SourceId) -> bool {
        let detached = {
            let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
            match sources.iter().position(|s| *s == source) {
                Some(idx) => {
                    sources.swap_remove(idx);
                    self.has_sources.store(!sources.is_empty(), Ordering::Release);
                    debug!("detach_suspending({source}) {}", sources.len());
                    true
                }
                None => false,
            }
        };
        if detached {
            // the kernel may be parked only because of this source
            self.async_wakeup();
        }
        detached
    }

    pub fn has_suspending_sources(&self) -> bool {
        self.has_sources.load(Ordering::Acquire)
    }

    pub fn suspending_sources(&self) -> usize {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing prevents the kernel from treating the simulation as quiescent.
    pub fn may_idle(&self) -> bool {
        !self.is_suspended() && !self.has_suspending_sources()
    }

    /// Wake a parked kernel. Safe from any thread; wakeups before a park are not lost.
    pub fn async_wakeup(&self) {
        let mut wakeups = self.wakeups.lock().unwrap_or_else(PoisonError::into_inner);
        *wakeups += 1;
        self.cond.notify_all();
    }

    /// Park the calling (kernel) thread until a wakeup arrives or `timeout` elapses.
    /// Returns true if woken, and consumes every wakeup that was pending.
    pub fn park(&self, timeout: Duration) -> bool {
        let wakeups = self.wakeups.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut wakeups, _) = self
            .cond
            .wait_timeout_while(wakeups, timeout, |w| *w == 0)
            .unwrap_or_else(PoisonError::into_inner);
        let woken = *wakeups > 0;
        *wakeups = 0;
        woken
    }
}

#[cfg(test)]
mod suspend_registry_tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn test_suspend_balance_clamps_at_zero() {
        let registry = SuspendRegistry::new();
        assert_eq!(registry.suspend_all(), 1);
        assert_eq!(registry.suspend_all(), 2);
        assert_eq!(registry.unsuspend_all(), 1);
        assert!(registry.is_suspended());
        assert_eq!(registry.unsuspend_all(), 0);
        assert!(!registry.is_suspended());
        assert_eq!(registry.unsuspend_all(), 0);
        assert_eq!(registry.suspend_count(), 0);
        assert!(registry.may_idle());
    }

    #[test]
    fn test_sources_block_idle() {
        let registry = SuspendRegistry::new();
        let a = registry.new_source_id();
        let b = registry.new_source_id();
        assert_ne!(a, b);
        assert!(registry.attach_suspending(a));
        assert!(!registry.attach_suspending(a));
        assert!(registry.attach_suspending(b));
        assert_eq!(registry.suspending_sources(), 2);
        assert!(!registry.may_idle());
        assert!(registry.detach_suspending(a));
        assert!(!registry.detach_suspending(a));
        assert!(!registry.may_idle());
        assert!(registry.detach_suspending(b));
        assert!(registry.may_idle());
    }

    #[test]
    fn test_wakeup_before_park_is_not_lost() {
        let registry = SuspendRegistry::new();
        registry.async_wakeup();
        registry.async_wakeup();
        let started = Instant::now();
        assert!(registry.park(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        // both wakeups were consumed by the single park
        assert!(!registry.park(Duration::from_millis(10)));
    }

    #[test]
    fn test_park_woken_from_other_thread() {
        let registry = Arc::new(SuspendRegistry::new());
        registry.suspend_all();
        let remote = Arc::clone(&registry);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.unsuspend_all();
        });
        let started = Instant::now();
        while registry.is_suspended() {
            registry.park(Duration::from_secs(5));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
