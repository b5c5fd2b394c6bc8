//! `qksync::kernel` contains a single-threaded cooperative discrete-event kernel
//! and the facade the synchronization core reads it through.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
    sync::Arc,
};

use log::{debug, trace};

use crate::{
    config::SimConfig,
    context::SimContext,
    sync::{async_event::AsyncInner, dispatch::MainThreadDispatcher},
    SimTime, SyncError,
};

pub mod clock;
mod event;

pub use event::{EventId, ProcessId};
use event::{EventSlot, Notification, Process};

/// Queries the synchronization core needs from the kernel.
pub trait KernelView {
    fn kernel_now(&self) -> SimTime;
    /// Delay until the next scheduled notification, if any.
    fn time_to_next_kernel_activity(&self) -> Option<SimTime>;
    fn kernel_activity_pending_now(&self) -> bool;
}

/// Why a run of the kernel loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing left to do and nothing attached that could produce work.
    Quiescent,
    LimitReached,
    /// `SimContext::request_stop` was called.
    Stopped,
    /// The event awaited by `wait_on` was triggered.
    EventFired,
}

pub struct Scheduler {
    ctx: Arc<SimContext>,
    now: SimTime,
    seq: u64,
    timed: BinaryHeap<Reverse<Notification>>,
    events: Vec<EventSlot>,
    processes: Vec<Process>,
    runnable: VecDeque<ProcessId>,
    async_events: Vec<Arc<AsyncInner>>,
    dispatcher: Option<Arc<MainThreadDispatcher>>,
    depth: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a kernel owned by the calling thread, which becomes the kernel thread.
    pub fn new() -> Self {
        Self::build(&SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self::build(&config))
    }

    fn build(config: &SimConfig) -> Self {
        Self {
            ctx: SimContext::new(config),
            now: SimTime::ZERO,
            seq: 0,
            timed: BinaryHeap::new(),
            events: Vec::new(),
            processes: Vec::new(),
            runnable: VecDeque::new(),
            async_events: Vec::new(),
            dispatcher: None,
            depth: 0,
        }
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    /// Get the current time of the simulation.
    #[inline(always)]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// The dispatcher serving this kernel, installed on first use.
    pub fn dispatcher(&mut self) -> Arc<MainThreadDispatcher> {
        if let Some(dispatcher) = &self.dispatcher {
            return Arc::clone(dispatcher);
        }
        let dispatcher = MainThreadDispatcher::install(self);
        self.dispatcher = Some(Arc::clone(&dispatcher));
        dispatcher
    }

    pub fn create_event(&mut self, name: impl Into<String>) -> EventId {
        self.events.push(EventSlot::new(name.into()));
        EventId(self.events.len() - 1)
    }

    pub fn event_name(&self, event: EventId) -> &str {
        &self.events[event.0].name
    }

    /// How many times the event has been triggered.
    pub fn fired(&self, event: EventId) -> u64 {
        self.events[event.0].fired
    }

    pub fn is_notified(&self, event: EventId) -> bool {
        self.events[event.0].pending.is_some()
    }

    /// Notify `event` after `delay`; zero means the next delta cycle.
    /// An earlier outstanding notification wins over a later one.
    pub fn notify(&mut self, event: EventId, delay: SimTime) {
        let at = self.now + delay;
        let slot = &mut self.events[event.0];
        if matches!(slot.pending, Some(pending) if pending <= at) {
            return;
        }
        slot.pending = Some(at);
        if self.depth > 0 {
            self.ctx.clock().note_activity(at, at <= self.now);
        }
        self.seq += 1;
        self.timed.push(Reverse(Notification {
            at,
            seq: self.seq,
            event,
        }));
    }

    pub fn cancel(&mut self, event: EventId) {
        self.events[event.0].pending = None;
    }

    /// Spawn a run-to-completion process triggered by any event in `sensitivity`.
    /// With `initialize` it also runs once in the next delta cycle.
    pub fn spawn_method<F>(
        &mut self,
        name: impl Into<String>,
        sensitivity: &[EventId],
        initialize: bool,
        body: F,
    ) -> ProcessId
    where
        F: FnMut(&mut Scheduler) + 'static,
    {
        let pid = ProcessId(self.processes.len());
        let name = name.into();
        trace!("spawn {name} sensitive to {} event(s)", sensitivity.len());
        self.processes.push(Process {
            name,
            body: Some(Box::new(body)),
            queued: false,
            retrigger: false,
        });
        for event in sensitivity {
            self.events[event.0].sensitive.push(pid);
        }
        if initialize {
            self.make_runnable(pid);
        }
        pid
    }

    pub fn process_name(&self, pid: ProcessId) -> &str {
        &self.processes[pid.0].name
    }

    pub(crate) fn register_async(&mut self, inner: Arc<AsyncInner>) {
        self.async_events.push(inner);
    }

    /// Run until quiescent or stopped.
    pub fn run(&mut self) -> Result<RunOutcome, SyncError> {
        self.run_top(None)
    }

    /// Run until `limit`, leaving the kernel at exactly `limit` when it gets there.
    pub fn run_until(&mut self, limit: SimTime) -> Result<RunOutcome, SyncError> {
        self.run_top(Some(limit))
    }

    pub fn run_for(&mut self, duration: SimTime) -> Result<RunOutcome, SyncError> {
        let limit = self.now + duration;
        self.run_top(Some(limit))
    }

    /// Keep the kernel running for `duration` from inside a process, then return to the caller.
    pub fn wait_for(&mut self, duration: SimTime) -> RunOutcome {
        let target = self.now + duration;
        self.run_loop(Some(target), None)
    }

    /// Keep the kernel running from inside a process until `event` is triggered.
    pub fn wait_on(&mut self, event: EventId) -> RunOutcome {
        let seen = self.fired(event);
        self.run_loop(None, Some((event, seen)))
    }

    fn run_top(&mut self, limit: Option<SimTime>) -> Result<RunOutcome, SyncError> {
        if self.depth > 0 {
            return Err(SyncError::ContractViolation(
                "the kernel cannot be re-entered from one of its processes, use wait_for or wait_on"
                    .to_string(),
            ));
        }
        let clock = Arc::clone(self.ctx.clock());
        clock.set_finished(false);
        debug!("kernel running from {}", self.now);
        let outcome = self.run_loop(limit, None);
        debug!("kernel returned at {}: {outcome:?}", self.now);
        match outcome {
            RunOutcome::Stopped => {
                self.ctx.clear_stop();
                clock.set_finished(true);
            }
            RunOutcome::Quiescent => clock.set_finished(true),
            _ => {}
        }
        Ok(outcome)
    }

    fn run_loop(&mut self, limit: Option<SimTime>, watch: Option<(EventId, u64)>) -> RunOutcome {
        let registry = Arc::clone(self.ctx.registry());
        let park_slice = self.ctx.park_slice();
        // a bounded wait inside an unsuspendable section moves time even while sources are attached
        let forced = || limit.is_some() && registry.has_unsuspendable();
        loop {
            if let Some((event, seen)) = watch {
                if self.fired(event) > seen {
                    return RunOutcome::EventFired;
                }
            }
            if self.ctx.stop_requested() {
                return RunOutcome::Stopped;
            }
            self.drain_async();
            self.publish();
            if self.evaluate_delta() {
                continue;
            }
            self.publish();

            if matches!(limit, Some(limit) if self.now >= limit) {
                return RunOutcome::LimitReached;
            }
            if registry.is_suspended() && !registry.has_unsuspendable() {
                trace!("{}: suspended ({})", self.now, registry.suspend_count());
                registry.park(park_slice);
                continue;
            }
            match (self.next_activity(), limit) {
                (Some(at), Some(limit)) if at > limit => {
                    self.advance(limit);
                    return RunOutcome::LimitReached;
                }
                (Some(at), _) => self.advance(at),
                (None, _) if registry.has_suspending_sources() && !forced() => {
                    trace!(
                        "{}: idle, waiting on {} suspending source(s)",
                        self.now,
                        registry.suspending_sources()
                    );
                    registry.park(park_slice);
                }
                // a source may have notified and detached since the drain above
                (None, _) if self.drain_async() => {}
                (None, Some(limit)) => {
                    self.advance(limit);
                    return RunOutcome::LimitReached;
                }
                (None, None) => return RunOutcome::Quiescent,
            }
        }
    }

    /// Turn cross-thread notifications into kernel notifications.
    fn drain_async(&mut self) -> bool {
        let mut due = Vec::new();
        self.async_events.retain(|inner| {
            if let Some(delay) = inner.take_pending() {
                due.push((inner.event(), delay));
            }
            if Arc::strong_count(inner) == 1 {
                // every handle is gone
                inner.detach_suspending();
                return false;
            }
            true
        });
        let drained = !due.is_empty();
        for (event, delay) in due {
            self.notify(event, delay);
        }
        drained
    }

    /// Trigger everything due at the current time and run one delta cycle.
    fn evaluate_delta(&mut self) -> bool {
        loop {
            match self.timed.peek() {
                Some(Reverse(n)) if n.at <= self.now => {}
                _ => break,
            }
            if let Some(Reverse(n)) = self.timed.pop() {
                self.trigger(n);
            }
        }
        if self.runnable.is_empty() {
            return false;
        }
        let batch: Vec<ProcessId> = self.runnable.drain(..).collect();
        // processes querying the clock see only what is left after this batch
        self.publish();
        for pid in batch {
            self.run_process(pid);
        }
        true
    }

    fn trigger(&mut self, n: Notification) {
        let Scheduler {
            events,
            processes,
            runnable,
            ..
        } = self;
        let slot = &mut events[n.event.0];
        if slot.pending != Some(n.at) {
            return;
        }
        slot.pending = None;
        slot.fired += 1;
        for pid in &slot.sensitive {
            let process = &mut processes[pid.0];
            if !process.queued {
                process.queued = true;
                runnable.push_back(*pid);
            }
        }
    }

    fn make_runnable(&mut self, pid: ProcessId) {
        let process = &mut self.processes[pid.0];
        if !process.queued {
            process.queued = true;
            self.runnable.push_back(pid);
        }
    }

    fn run_process(&mut self, pid: ProcessId) {
        let process = &mut self.processes[pid.0];
        process.queued = false;
        let Some(mut body) = process.body.take() else {
            // still executing further up the stack, run again once it returns
            process.retrigger = true;
            return;
        };
        self.depth += 1;
        body(self);
        self.depth -= 1;
        let process = &mut self.processes[pid.0];
        process.body = Some(body);
        if std::mem::take(&mut process.retrigger) {
            self.make_runnable(pid);
        }
    }

    fn next_activity(&self) -> Option<SimTime> {
        self.events.iter().filter_map(|e| e.pending).min()
    }

    fn advance(&mut self, at: SimTime) {
        debug_assert!(at >= self.now, "kernel time must not go backwards");
        self.now = at;
        self.ctx.clock().set_now(at);
    }

    fn publish(&self) {
        self.ctx
            .clock()
            .publish(self.next_activity(), self.kernel_activity_pending_now());
    }
}

impl KernelView for Scheduler {
    fn kernel_now(&self) -> SimTime {
        self.now
    }

    fn time_to_next_kernel_activity(&self) -> Option<SimTime> {
        self.next_activity()
            .map(|at| at.saturating_sub(self.now))
    }

    fn kernel_activity_pending_now(&self) -> bool {
        !self.runnable.is_empty() || matches!(self.next_activity(), Some(at) if at <= self.now)
    }
}
