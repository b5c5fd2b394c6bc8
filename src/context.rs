use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use log::{debug, warn};

use crate::{
    config::SimConfig, keeper::KeeperShared, kernel::clock::KernelClock,
    sync::pause::SuspendRegistry, SimTime, SyncError,
};

/// State shared by everything taking part in one simulation session.
///
/// Built by the kernel on its own thread and handed out by `Arc`; replaces
/// the process-wide globals (quantum, suspend counter) a simulator would
/// otherwise keep in statics.
pub struct SimContext {
    quantum: AtomicU64,
    quantum_frozen: AtomicBool,
    kernel_thread: ThreadId,
    registry: Arc<SuspendRegistry>,
    clock: Arc<KernelClock>,
    stop_requested: AtomicBool,
    park_slice: Duration,
    keepers: Mutex<Vec<Weak<KeeperShared>>>,
}

impl SimContext {
    pub(crate) fn new(config: &SimConfig) -> Arc<Self> {
        Arc::new(Self {
            quantum: AtomicU64::new(config.quantum.as_ps()),
            quantum_frozen: AtomicBool::new(false),
            kernel_thread: thread::current().id(),
            registry: Arc::new(SuspendRegistry::new()),
            clock: Arc::new(KernelClock::new()),
            stop_requested: AtomicBool::new(false),
            park_slice: config.park_slice,
            keepers: Mutex::new(Vec::new()),
        })
    }

    /// The global quantum read by every sync policy.
    #[inline(always)]
    pub fn quantum(&self) -> SimTime {
        SimTime::from_ps(self.quantum.load(Ordering::Acquire))
    }

    /// Set the global quantum. Only allowed before the first keeper starts.
    pub fn set_global_quantum(&self, quantum: SimTime) -> Result<(), SyncError> {
        if quantum.is_zero() {
            return Err(SyncError::ConfigError(
                "Quantum must be positive".to_string(),
            ));
        }
        if self.quantum_frozen.load(Ordering::Acquire) {
            return Err(SyncError::QuantumFrozen);
        }
        debug!("global quantum set to {quantum}");
        self.quantum.store(quantum.as_ps(), Ordering::Release);
        Ok(())
    }

    pub(crate) fn freeze_quantum(&self) {
        if !self.quantum_frozen.swap(true, Ordering::AcqRel) {
            debug!("global quantum frozen at {}", self.quantum());
        }
    }

    pub fn is_quantum_frozen(&self) -> bool {
        self.quantum_frozen.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_kernel_thread(&self) -> bool {
        thread::current().id() == self.kernel_thread
    }

    pub fn kernel_thread(&self) -> ThreadId {
        self.kernel_thread
    }

    pub fn registry(&self) -> &Arc<SuspendRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<KernelClock> {
        &self.clock
    }

    pub fn park_slice(&self) -> Duration {
        self.park_slice
    }

    /// Ask the kernel loop to return at its next iteration. Safe from any thread.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.registry.async_wakeup();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Release);
    }

    pub(crate) fn register_keeper(&self, keeper: Weak<KeeperShared>) {
        let mut keepers = self.keepers.lock().unwrap_or_else(PoisonError::into_inner);
        keepers.retain(|k| k.strong_count() > 0);
        keepers.push(keeper);
    }

    /// Stop every live keeper and then the kernel. Returns how many keepers were signalled.
    ///
    /// Worker threads are not joined here; `QuantumKeeper::join` or dropping
    /// the keeper does that.
    pub fn shutdown(&self) -> usize {
        let keepers: Vec<_> = {
            let keepers = self.keepers.lock().unwrap_or_else(PoisonError::into_inner);
            keepers.iter().filter_map(Weak::upgrade).collect()
        };
        let mut signalled = 0;
        for keeper in keepers {
            if keeper.signal_stop() {
                signalled += 1;
            }
        }
        if signalled > 0 {
            warn!("shutdown stopped {signalled} running keeper(s)");
        }
        self.request_stop();
        signalled
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;

    #[test]
    fn test_quantum_frozen_after_start() {
        let ctx = SimContext::new(&SimConfig::new());
        assert_eq!(ctx.quantum(), SimTime::from_ms(1));
        ctx.set_global_quantum(SimTime::from_us(10)).unwrap();
        assert_eq!(ctx.quantum(), SimTime::from_us(10));
        assert!(matches!(
            ctx.set_global_quantum(SimTime::ZERO),
            Err(SyncError::ConfigError(_))
        ));
        ctx.freeze_quantum();
        assert!(matches!(
            ctx.set_global_quantum(SimTime::from_us(20)),
            Err(SyncError::QuantumFrozen)
        ));
        assert_eq!(ctx.quantum(), SimTime::from_us(10));
    }

    #[test]
    fn test_kernel_thread_identity() {
        let ctx = SimContext::new(&SimConfig::new());
        assert!(ctx.is_kernel_thread());
        let remote = Arc::clone(&ctx);
        let on_worker = std::thread::spawn(move || remote.is_kernel_thread())
            .join()
            .unwrap();
        assert!(!on_worker);
    }
}
