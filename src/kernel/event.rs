use crate::{kernel::Scheduler, SimTime};

/// Handle to a kernel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub(crate) usize);

/// Handle to a process spawned on the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub(crate) usize);

pub(crate) struct EventSlot {
    pub name: String,
    /// At most one outstanding notification per event.
    pub pending: Option<SimTime>,
    pub sensitive: Vec<ProcessId>,
    pub fired: u64,
}

impl EventSlot {
    pub fn new(name: String) -> Self {
        Self {
            name,
            pending: None,
            sensitive: Vec::new(),
            fired: 0,
        }
    }
}

/// Entry of the timed queue; stale once the event's `pending` no longer matches `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Notification {
    pub at: SimTime,
    pub seq: u64,
    pub event: EventId,
}

pub(crate) type ProcessBody = Box<dyn FnMut(&mut Scheduler)>;

pub(crate) struct Process {
    pub name: String,
    /// `None` while the body is executing further up the stack.
    pub body: Option<ProcessBody>,
    pub queued: bool,
    pub retrigger: bool,
}
