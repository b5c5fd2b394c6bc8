use std::{
    sync::{Arc, Mutex, PoisonError},
    thread::ThreadId,
};

use log::trace;

use crate::{
    kernel::{EventId, RunOutcome, Scheduler},
    sync::pause::{SourceId, SuspendRegistry},
    SimTime, SyncError,
};

pub(crate) struct AsyncInner {
    event: EventId,
    source: SourceId,
    /// Delay of the earliest notification raised since the last drain.
    pending: Mutex<Option<SimTime>>,
    registry: Arc<SuspendRegistry>,
    kernel_thread: ThreadId,
}

impl AsyncInner {
    pub(crate) fn event(&self) -> EventId {
        self.event
    }

    /// Checked-then-cleared under the lock, so a notify racing the drain lands
    /// either in this drain or the next one.
    pub(crate) fn take_pending(&self) -> Option<SimTime> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn detach_suspending(&self) -> bool {
        self.registry.detach_suspending(self.source)
    }
}

/// Kernel event that any thread may notify.
///
/// Notifications raised between two drains of the kernel loop coalesce into
/// one, keeping the earliest requested delay.
#[derive(Clone)]
pub struct CrossThreadEvent {
    inner: Arc<AsyncInner>,
}

impl CrossThreadEvent {
    /// Create the event on the kernel. With `attach` the kernel will not go
    /// quiescent until the event is detached or every handle is dropped.
    pub fn new(sched: &mut Scheduler, name: impl Into<String>, attach: bool) -> Self {
        let event = sched.create_event(name);
        let registry = Arc::clone(sched.context().registry());
        let inner = Arc::new(AsyncInner {
            event,
            source: registry.new_source_id(),
            pending: Mutex::new(None),
            registry,
            kernel_thread: sched.context().kernel_thread(),
        });
        sched.register_async(Arc::clone(&inner));
        let ev = Self { inner };
        if attach {
            ev.attach_suspending();
        }
        ev
    }

    /// The kernel-side event processes can be made sensitive to.
    pub fn event(&self) -> EventId {
        self.inner.event
    }

    pub fn notify(&self) {
        self.notify_after(SimTime::ZERO);
    }

    /// Notify `delay` after the kernel time at which the kernel picks the request up.
    pub fn notify_after(&self, delay: SimTime) {
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *pending = Some(match *pending {
                Some(earlier) => earlier.min(delay),
                None => delay,
            });
        }
        trace!("cross-thread notify (+{delay})");
        self.inner.registry.async_wakeup();
    }

    pub fn is_pending(&self) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn attach_suspending(&self) -> bool {
        self.inner.registry.attach_suspending(self.inner.source)
    }

    pub fn detach_suspending(&self) -> bool {
        self.inner.detach_suspending()
    }

    /// Yield to the kernel until this event fires. Kernel thread only.
    pub fn wait(&self, sched: &mut Scheduler) -> Result<RunOutcome, SyncError> {
        if std::thread::current().id() != self.inner.kernel_thread {
            return Err(SyncError::NotKernelThread("CrossThreadEvent::wait"));
        }
        Ok(sched.wait_on(self.inner.event))
    }
}

#[cfg(test)]
mod cross_thread_event_tests {
    use std::{cell::RefCell, rc::Rc, thread, time::Duration};

    use super::*;

    #[test]
    fn test_repeated_notifies_coalesce() {
        let mut sched = Scheduler::new();
        let ev = CrossThreadEvent::new(&mut sched, "wake", false);
        let runs = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&runs);
        sched.spawn_method("wake", &[ev.event()], false, move |_| {
            *counter.borrow_mut() += 1;
        });
        let remote = ev.clone();
        thread::spawn(move || {
            for _ in 0..5 {
                remote.notify();
            }
        })
        .join()
        .unwrap();
        assert!(ev.is_pending());
        sched.run().unwrap();
        assert_eq!(*runs.borrow(), 1);
        assert!(!ev.is_pending());
    }

    #[test]
    fn test_notify_racing_drain_is_never_lost() {
        const ROUNDS: usize = 500;
        let mut sched = Scheduler::new();
        let ev = CrossThreadEvent::new(&mut sched, "ping", true);
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded();
        sched.spawn_method("pong", &[ev.event()], false, move |_| {
            let _ = ack_tx.send(());
        });
        let remote = ev.clone();
        let worker = thread::spawn(move || {
            let mut acked = 0;
            for _ in 0..ROUNDS {
                remote.notify();
                if ack_rx.recv_timeout(Duration::from_secs(5)).is_err() {
                    break;
                }
                acked += 1;
            }
            remote.detach_suspending();
            acked
        });
        assert_eq!(sched.run().unwrap(), RunOutcome::Quiescent);
        assert_eq!(worker.join().unwrap(), ROUNDS);
        assert!(!ev.is_pending());
    }

    #[test]
    fn test_notify_after_keeps_earliest_delay() {
        let mut sched = Scheduler::new();
        let ev = CrossThreadEvent::new(&mut sched, "timer", false);
        let hits = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&hits);
        sched.spawn_method("timer", &[ev.event()], false, move |s| {
            seen.borrow_mut().push(s.now());
        });
        ev.notify_after(SimTime::from_us(30));
        ev.notify_after(SimTime::from_us(10));
        ev.notify_after(SimTime::from_us(20));
        sched.run().unwrap();
        assert_eq!(*hits.borrow(), vec![SimTime::from_us(10)]);
    }

    #[test]
    fn test_attached_event_keeps_kernel_alive() {
        let mut sched = Scheduler::new();
        let ev = CrossThreadEvent::new(&mut sched, "remote", true);
        assert!(!sched.context().registry().may_idle());
        let hits = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&hits);
        sched.spawn_method("remote", &[ev.event()], false, move |_| {
            *counter.borrow_mut() += 1;
        });
        let remote = ev.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.notify_after(SimTime::from_ns(7));
            remote.detach_suspending();
        });
        assert_eq!(sched.run().unwrap(), RunOutcome::Quiescent);
        worker.join().unwrap();
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(sched.now(), SimTime::from_ns(7));
        assert!(sched.context().registry().may_idle());
    }

    #[test]
    fn test_wait_returns_once_notified() {
        let mut sched = Scheduler::new();
        let ev = CrossThreadEvent::new(&mut sched, "ready", false);
        let out = Rc::new(RefCell::new(None));
        let result = Rc::clone(&out);
        let waiter = ev.clone();
        sched.spawn_method("waiter", &[], true, move |s| {
            *result.borrow_mut() = Some(waiter.wait(s).unwrap());
        });
        let remote = ev.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.notify();
        });
        ev.attach_suspending();
        let detach = ev.clone();
        sched.spawn_method("detach", &[ev.event()], false, move |_| {
            detach.detach_suspending();
        });
        sched.run().unwrap();
        assert_eq!(*out.borrow(), Some(RunOutcome::EventFired));
    }
}
