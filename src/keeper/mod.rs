//! Quantum keepers: per-worker local time plus the protocol that reconciles it
//! with the kernel.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

use log::{debug, trace, warn};
use strum::Display;

use crate::{
    config::{KeeperConfig, PolicyKind, ThreadType},
    context::SimContext,
    kernel::{KernelView, Scheduler},
    sync::{async_event::CrossThreadEvent, rendezvous::Rendezvous},
    SimTime, SyncError,
};

pub mod policy;

use policy::{
    rolling_budget, AdaptiveQuantum, BoundedQuantum, FreeRunning, Horizon, Policy, Rolling,
    SyncPolicy, Unconstrained,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum KeeperState {
    #[strum(to_string = "STOPPED")]
    Stopped = 0,
    #[strum(to_string = "RUNNING")]
    Running = 1,
}

/// Debug snapshot of a keeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeeperStatus {
    pub state: KeeperState,
    /// The time handler is holding the kernel until the worker moves on.
    pub kernel_waiting: bool,
    /// The worker is blocked in `sync`.
    pub worker_waiting: bool,
}

/// Keeper state reachable from the kernel-side processes and from `SimContext::shutdown`.
pub(crate) struct KeeperShared {
    name: String,
    ctx: Arc<SimContext>,
    state: AtomicU8,
    /// Kernel time at the last sync point.
    anchor: AtomicU64,
    offset: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
    /// Bumped under `lock` every time the worker is woken.
    wakeups: AtomicU64,
    tick: CrossThreadEvent,
    kernel_waiting: AtomicBool,
    worker_waiting: AtomicBool,
    mailbox: Option<Arc<Rendezvous>>,
}

impl KeeperShared {
    #[inline(always)]
    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == KeeperState::Running as u8
    }

    fn current_time(&self) -> SimTime {
        SimTime::from_ps(self.anchor.load(Ordering::Acquire))
            + SimTime::from_ps(self.offset.load(Ordering::Acquire))
    }

    /// Move the sync point to `now`. The offset is cleared first so a concurrent
    /// reader never sees a local time past the real one.
    fn commit(&self, now: SimTime) {
        self.offset.store(0, Ordering::Release);
        self.anchor.store(now.as_ps(), Ordering::Release);
    }

    fn wake_worker(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.wakeups.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    /// Flip to STOPPED and release everything blocked on this keeper.
    /// Returns false if the keeper was not running.
    pub(crate) fn signal_stop(&self) -> bool {
        if self
            .state
            .compare_exchange(
                KeeperState::Running as u8,
                KeeperState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        debug!("{}: stopped", self.name);
        if let Some(mailbox) = &self.mailbox {
            mailbox.close();
        }
        self.wake_worker();
        self.tick.notify();
        true
    }

    /// Kernel side of the keeper. Lets the kernel run while the worker is
    /// ahead and holds it once it has caught up.
    fn on_tick(&self, sched: &mut Scheduler) {
        let registry = self.ctx.registry();
        if !self.is_running() {
            if self.kernel_waiting.swap(false, Ordering::AcqRel) {
                registry.unsuspend_all();
            }
            self.tick.detach_suspending();
            self.wake_worker();
            return;
        }
        let now = sched.now();
        let local = self.current_time();
        if local > now {
            if self.kernel_waiting.swap(false, Ordering::AcqRel) {
                trace!("{}: worker ahead at {local}, releasing kernel at {now}", self.name);
                registry.unsuspend_all();
            }
            let quantum = self.ctx.quantum();
            let ahead = local - now;
            let step = if quantum.is_zero() {
                ahead
            } else {
                ahead.min(quantum)
            };
            sched.notify(self.tick.event(), step);
        } else if !self.kernel_waiting.swap(true, Ordering::AcqRel) {
            trace!("{}: kernel caught up at {now}, holding", self.name);
            registry.suspend_all();
        }
        self.wake_worker();
    }
}

/// Local time of one worker and the policy deciding when it must sync.
///
/// Lives for the whole simulation: created at elaboration, `start`ed when
/// the worker begins, `stop`ped and joined at teardown. Only `stop` is meant
/// to be called from threads other than the worker's.
pub struct QuantumKeeper {
    shared: Arc<KeeperShared>,
    policy: Policy,
    config: KeeperConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QuantumKeeper {
    /// Build a stopped keeper and its kernel-side processes.
    pub fn new(sched: &mut Scheduler, config: KeeperConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let ctx = Arc::clone(sched.context());
        let name = config.name.clone();
        let tick = CrossThreadEvent::new(sched, format!("{name}.tick"), false);
        let mailbox = (config.policy == PolicyKind::Rolling).then(|| Arc::new(Rendezvous::new()));
        let shared = Arc::new(KeeperShared {
            name: name.clone(),
            ctx: Arc::clone(&ctx),
            state: AtomicU8::new(KeeperState::Stopped as u8),
            anchor: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            wakeups: AtomicU64::new(0),
            tick: tick.clone(),
            kernel_waiting: AtomicBool::new(false),
            worker_waiting: AtomicBool::new(false),
            mailbox: mailbox.clone(),
        });
        let handler = Arc::clone(&shared);
        sched.spawn_method(
            format!("{name}.timehandler"),
            &[tick.event()],
            false,
            move |s| handler.on_tick(s),
        );

        let policy = match (config.policy, mailbox) {
            (PolicyKind::BoundedQuantum, _) => Policy::Bounded(BoundedQuantum),
            (PolicyKind::AdaptiveQuantum, _) => Policy::Adaptive(AdaptiveQuantum),
            (PolicyKind::Unconstrained, _) => Policy::Unconstrained(Unconstrained),
            (PolicyKind::FreeRunning, _) => Policy::FreeRunning(FreeRunning),
            (PolicyKind::Rolling, mailbox) => {
                let mailbox = mailbox.unwrap_or_default();
                let ask = CrossThreadEvent::new(sched, format!("{name}.ask"), false);
                let responder = Arc::clone(&shared);
                let answers = Arc::clone(&mailbox);
                sched.spawn_method(format!("{name}.budget"), &[ask.event()], false, move |s| {
                    let (ticket, local) = answers.pending();
                    let horizon = Horizon {
                        kernel_time: s.now(),
                        local_time: local,
                        quantum: responder.ctx.quantum(),
                        running: responder.is_running(),
                    };
                    let pending_now = s.kernel_activity_pending_now();
                    if pending_now {
                        // let the time handler re-evaluate once this delta settles
                        s.notify(responder.tick.event(), SimTime::ZERO);
                    }
                    let budget =
                        rolling_budget(&horizon, pending_now, s.time_to_next_kernel_activity());
                    trace!("{}: budget {budget} for ticket {ticket}", responder.name);
                    answers.answer(ticket, budget);
                });
                Policy::Rolling(Rolling::new(ask, mailbox, Arc::clone(&ctx), config.watchdog))
            }
        };

        ctx.register_keeper(Arc::downgrade(&shared));
        debug!("{name}: created with {} policy", config.policy);
        Ok(Self {
            shared,
            policy,
            config,
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.config.policy
    }

    pub fn get_thread_type(&self) -> ThreadType {
        self.config.thread_type
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn status(&self) -> KeeperStatus {
        let shared = &self.shared;
        KeeperStatus {
            state: if shared.is_running() {
                KeeperState::Running
            } else {
                KeeperState::Stopped
            },
            kernel_waiting: shared.kernel_waiting.load(Ordering::Acquire),
            worker_waiting: shared.worker_waiting.load(Ordering::Acquire),
        }
    }

    /// Start without a job; the caller drives the keeper from its own thread.
    pub fn start(&self) -> Result<(), SyncError> {
        self.launch()
    }

    /// Start and run `job` on a new worker thread. The keeper stops when `job` returns.
    pub fn start_with<F>(&self, job: F) -> Result<(), SyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.config.thread_type == ThreadType::KernelThread {
            return Err(SyncError::ContractViolation(format!(
                "{}: kernel-thread keepers take their job through start_on_kernel",
                self.name()
            )));
        }
        self.launch()?;
        // a previous worker has been released by stop()
        self.join()?;
        let owner = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || {
                job();
                if owner.signal_stop() {
                    debug!("{}: job returned", owner.name);
                }
            });
        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.signal_stop();
                Err(err.into())
            }
        }
    }

    /// Start a `ThreadType::KernelThread` keeper whose `job` runs as a kernel
    /// process in the next delta cycle and syncs through `sync_in`. The keeper
    /// stops when `job` returns.
    pub fn start_on_kernel<F>(&self, sched: &mut Scheduler, job: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut Scheduler) + 'static,
    {
        if self.config.thread_type != ThreadType::KernelThread {
            return Err(SyncError::ContractViolation(format!(
                "{}: only kernel-thread keepers run their job on the kernel",
                self.name()
            )));
        }
        self.launch()?;
        let owner = Arc::clone(&self.shared);
        let mut job = Some(job);
        sched.spawn_method(format!("{}.job", self.name()), &[], true, move |s| {
            if let Some(job) = job.take() {
                job(s);
                if owner.signal_stop() {
                    debug!("{}: job returned", owner.name);
                }
            }
        });
        Ok(())
    }

    fn launch(&self) -> Result<(), SyncError> {
        let shared = &self.shared;
        if shared
            .state
            .compare_exchange(
                KeeperState::Stopped as u8,
                KeeperState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(SyncError::AlreadyRunning(shared.name.clone()));
        }
        shared.ctx.freeze_quantum();
        shared.commit(shared.ctx.clock().now());
        if let Some(mailbox) = &shared.mailbox {
            mailbox.reopen();
        }
        shared.tick.attach_suspending();
        shared.tick.notify();
        debug!("{}: started at {}", shared.name, self.current_time());
        Ok(())
    }

    /// Stop the keeper. Safe from any thread, including while the worker is
    /// blocked in `sync` or a budget request: those return at once.
    pub fn stop(&self) {
        self.shared.signal_stop();
    }

    /// Wait for the worker thread started by `start_with`.
    pub fn join(&self) -> Result<(), SyncError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        match worker.take() {
            Some(handle) if handle.thread().id() == thread::current().id() => {
                *worker = Some(handle);
                Ok(())
            }
            Some(handle) => {
                drop(worker);
                handle.join().map_err(|_| SyncError::ThreadPanic)
            }
            None => Ok(()),
        }
    }

    /// Drop the uncommitted offset.
    pub fn reset(&self) -> Result<(), SyncError> {
        if !self.shared.is_running() {
            return Err(SyncError::NotRunning(self.shared.name.clone()));
        }
        self.shared.offset.store(0, Ordering::Release);
        Ok(())
    }

    /// Advance the uncommitted offset. Running past the end of the time range
    /// is a contract violation and leaves the offset untouched.
    #[inline(always)]
    pub fn inc(&self, duration: SimTime) -> Result<(), SyncError> {
        let shared = &self.shared;
        let anchor = shared.anchor.load(Ordering::Acquire);
        shared
            .offset
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |offset| {
                offset
                    .checked_add(duration.as_ps())
                    .filter(|next| anchor.checked_add(*next).is_some())
            })
            .map(|_| ())
            .map_err(|offset| {
                SyncError::ContractViolation(format!(
                    "{}: local time {} overflows when advanced by {duration}",
                    shared.name,
                    SimTime::from_ps(anchor) + SimTime::from_ps(offset)
                ))
            })
    }

    /// Put the local time `t` past the current kernel time. Local time never moves back.
    pub fn set(&self, t: SimTime) -> Result<(), SyncError> {
        let shared = &self.shared;
        let target = shared.ctx.clock().now() + t;
        let current = shared.current_time();
        if target < current {
            return Err(SyncError::ContractViolation(format!(
                "{}: cannot move local time back from {current} to {target}",
                shared.name
            )));
        }
        let anchor = SimTime::from_ps(shared.anchor.load(Ordering::Acquire));
        shared
            .offset
            .store((target - anchor).as_ps(), Ordering::Release);
        shared.tick.notify();
        Ok(())
    }

    fn horizon(&self) -> Horizon {
        let shared = &self.shared;
        Horizon {
            kernel_time: shared.ctx.clock().now(),
            local_time: shared.current_time(),
            quantum: shared.ctx.quantum(),
            running: shared.is_running(),
        }
    }

    pub fn time_to_sync(&self) -> SimTime {
        self.policy.time_to_sync(&self.horizon())
    }

    pub fn need_sync(&self) -> bool {
        self.policy.need_sync(&self.horizon())
    }

    /// Kernel time plus the uncommitted offset.
    pub fn get_local_time(&self) -> SimTime {
        self.shared.ctx.clock().now() + SimTime::from_ps(self.shared.offset.load(Ordering::Acquire))
    }

    /// Absolute worker time: last sync point plus the uncommitted offset.
    pub fn current_time(&self) -> SimTime {
        self.shared.current_time()
    }

    /// Reconcile with the kernel from the worker thread.
    ///
    /// FreeRunning blocks until the kernel has reached this worker's time and
    /// then commits the offset. Every other policy commits the offset at once
    /// and blocks only while its budget is zero. Returns `Ok` as soon as the
    /// keeper is stopped. The kernel side is `sync_in`.
    pub fn sync(&self) -> Result<(), SyncError> {
        let shared = &self.shared;
        if !shared.is_running() {
            return Err(SyncError::NotRunning(shared.name.clone()));
        }
        if shared.ctx.is_kernel_thread() {
            return Err(SyncError::KernelThreadForbidden("QuantumKeeper::sync"));
        }
        shared.worker_waiting.store(true, Ordering::Release);
        match self.config.policy {
            PolicyKind::FreeRunning => self.wait_for_kernel(),
            _ => self.wait_for_budget(),
        }
        shared.worker_waiting.store(false, Ordering::Release);
        Ok(())
    }

    fn wait_for_budget(&self) {
        let shared = &self.shared;
        shared.commit(shared.current_time());
        shared.tick.notify();
        let watchdog = self.config.watchdog;
        loop {
            let seen = shared.wakeups.load(Ordering::Acquire);
            if !shared.is_running() || !self.time_to_sync().is_zero() {
                return;
            }
            let guard = shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.wakeups.load(Ordering::Acquire) != seen {
                continue;
            }
            let (guard, timeout) = shared
                .cond
                .wait_timeout(guard, watchdog)
                .unwrap_or_else(PoisonError::into_inner);
            drop(guard);
            if timeout.timed_out() && shared.wakeups.load(Ordering::Acquire) == seen {
                warn!(
                    "{}: no budget at {} after {watchdog:?}",
                    shared.name,
                    shared.current_time()
                );
                shared.tick.notify();
            }
        }
    }

    fn wait_for_kernel(&self) {
        let shared = &self.shared;
        let clock = shared.ctx.clock();
        let target = shared.current_time();
        let watchdog = self.config.watchdog;
        shared.tick.notify();

        let mut guard = shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while shared.is_running() && clock.now() < target {
            let (next, timeout) = shared
                .cond
                .wait_timeout(guard, watchdog)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
            if timeout.timed_out() && shared.is_running() && clock.now() < target {
                warn!(
                    "{}: kernel still at {} waiting for {target} after {watchdog:?}",
                    shared.name,
                    clock.now()
                );
                shared.tick.notify();
            }
        }
        drop(guard);

        if shared.is_running() {
            shared.commit(clock.now());
        }
    }

    /// Kernel-thread sync: run the kernel forward by the outstanding offset,
    /// then commit it and wake the worker.
    pub fn sync_in(&self, sched: &mut Scheduler) -> Result<(), SyncError> {
        let shared = &self.shared;
        if !shared.ctx.is_kernel_thread() {
            return Err(SyncError::NotKernelThread("QuantumKeeper::sync_in"));
        }
        if !shared.is_running() {
            return Err(SyncError::NotRunning(shared.name.clone()));
        }
        let target = shared.current_time();
        if target > sched.now() {
            let registry = Arc::clone(shared.ctx.registry());
            registry.enter_unsuspendable();
            sched.wait_for(target - sched.now());
            registry.leave_unsuspendable();
        }
        shared.commit(sched.now());
        shared.wake_worker();
        Ok(())
    }
}

impl Drop for QuantumKeeper {
    fn drop(&mut self) {
        self.stop();
        if self.join().is_err() {
            warn!("{}: worker thread panicked", self.shared.name);
        }
    }
}

/// Build a keeper from a policy name (`"bounded-quantum"`, `"adaptive"`,
/// `"rolling"`, `"unconstrained"`, `"freerunning"`).
pub fn create_keeper(sched: &mut Scheduler, name: &str) -> Result<Arc<QuantumKeeper>, SyncError> {
    let config = KeeperConfig::from_name(name)?;
    Ok(Arc::new(QuantumKeeper::new(sched, config)?))
}
