use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::{
    context::SimContext, kernel::Scheduler, sync::async_event::CrossThreadEvent, SyncError,
};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

const WAIT_SLICE: Duration = Duration::from_secs(1);

/// Runs closures on the kernel thread on behalf of any other thread.
///
/// Jobs execute inside an unsuspendable section, in submission order, the next
/// time the kernel drains its cross-thread events.
pub struct MainThreadDispatcher {
    ctx: Arc<SimContext>,
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    event: CrossThreadEvent,
    executed: AtomicU64,
}

impl MainThreadDispatcher {
    pub(crate) fn install(sched: &mut Scheduler) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let event = CrossThreadEvent::new(sched, "dispatcher", false);
        let dispatcher = Arc::new(Self {
            ctx: Arc::clone(sched.context()),
            jobs_tx,
            jobs_rx,
            event: event.clone(),
            executed: AtomicU64::new(0),
        });
        let runner = Arc::clone(&dispatcher);
        sched.spawn_method("dispatcher", &[event.event()], false, move |_| {
            runner.drain();
        });
        dispatcher
    }

    fn drain(&self) {
        let registry = self.ctx.registry();
        registry.enter_unsuspendable();
        while let Ok(job) = self.jobs_rx.try_recv() {
            job();
            self.executed.fetch_add(1, Ordering::Relaxed);
        }
        registry.leave_unsuspendable();
    }

    /// Run `f` on the kernel thread and wait for its result.
    ///
    /// Called from the kernel thread, `f` runs inline. Returns
    /// `SyncError::Cancelled` if the job is dropped by `cancel_pending` or the
    /// kernel finishes without running it.
    pub fn run_on_kernel<F, R>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.ctx.is_kernel_thread() {
            return Ok(f());
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.submit(Box::new(move || {
            // the caller may have given up already
            let _ = done_tx.send(f());
        }))?;
        loop {
            match done_rx.recv_timeout(WAIT_SLICE) {
                Ok(result) => return Ok(result),
                Err(RecvTimeoutError::Disconnected) => return Err(SyncError::Cancelled),
                Err(RecvTimeoutError::Timeout) => {
                    if self.ctx.clock().is_finished() {
                        let dropped = self.cancel_pending();
                        debug!("kernel finished, cancelled {dropped} dispatcher job(s)");
                        // the job may have run just before the kernel finished
                        return done_rx.try_recv().map_err(|_| SyncError::Cancelled);
                    }
                    warn!("still waiting for the kernel to run a dispatched job");
                    self.event.notify();
                }
            }
        }
    }

    /// Queue `f` for the kernel thread without waiting. Runs inline on the kernel thread.
    pub fn fork_on_kernel<F>(&self, f: F) -> Result<(), SyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.ctx.is_kernel_thread() {
            f();
            self.executed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.submit(Box::new(f))
    }

    /// Queue a job even when called from the kernel thread.
    pub(crate) fn submit(&self, job: Job) -> Result<(), SyncError> {
        self.jobs_tx.send(job).map_err(|_| SyncError::Cancelled)?;
        self.event.notify();
        Ok(())
    }

    /// Drop every queued job; their blocked callers return `SyncError::Cancelled`.
    pub fn cancel_pending(&self) -> usize {
        self.jobs_rx.try_iter().count()
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs_rx.len()
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod dispatcher_tests {
    use std::{sync::atomic::AtomicBool, thread};

    use super::*;
    use crate::{RunOutcome, SimTime};

    #[test]
    fn test_runs_inline_on_kernel_thread() {
        let mut sched = Scheduler::new();
        let dispatcher = sched.dispatcher();
        assert!(Arc::ptr_eq(&dispatcher, &sched.dispatcher()));
        assert_eq!(dispatcher.run_on_kernel(|| 6 * 7).unwrap(), 42);
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        dispatcher
            .fork_on_kernel(move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending_jobs(), 0);
        assert_eq!(dispatcher.executed(), 1);
    }

    #[test]
    fn test_worker_job_runs_on_kernel_thread() {
        let mut sched = Scheduler::new();
        let kernel = thread::current().id();
        let dispatcher = sched.dispatcher();
        let done = CrossThreadEvent::new(&mut sched, "worker.done", true);
        let remote = Arc::clone(&dispatcher);
        let worker = thread::spawn(move || {
            let ran_on = remote.run_on_kernel(|| thread::current().id());
            let forked = remote.fork_on_kernel(|| {});
            done.detach_suspending();
            (ran_on.unwrap(), forked.is_ok())
        });
        sched.run_for(SimTime::from_secs(1)).unwrap();
        let (ran_on, forked) = worker.join().unwrap();
        assert_eq!(ran_on, kernel);
        assert!(forked);
        assert_eq!(dispatcher.pending_jobs(), 0);
    }

    #[test]
    fn test_cancel_pending_unblocks_caller() {
        let mut sched = Scheduler::new();
        let dispatcher = sched.dispatcher();
        let remote = Arc::clone(&dispatcher);
        let worker = thread::spawn(move || remote.run_on_kernel(|| 1));
        while dispatcher.pending_jobs() == 0 {
            thread::yield_now();
        }
        assert_eq!(dispatcher.cancel_pending(), 1);
        assert!(matches!(worker.join().unwrap(), Err(SyncError::Cancelled)));
        assert_eq!(sched.run().unwrap(), RunOutcome::Quiescent);
        assert_eq!(dispatcher.executed(), 0);
    }
}
