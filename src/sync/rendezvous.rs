use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

use log::warn;

use crate::{sync::async_event::CrossThreadEvent, SimTime};

#[derive(Default)]
struct Mailbox {
    requested: u64,
    answered: u64,
    /// Local time carried by the latest request.
    local: SimTime,
    budget: SimTime,
    closed: bool,
}

/// Single-slot question/answer channel between one worker and the kernel.
///
/// Requests carry a monotonic ticket; an answer covers every ticket up to the
/// one the kernel observed before computing it, so a request raised while an
/// older one is still being answered is never lost.
#[derive(Default)]
pub(crate) struct Rendezvous {
    mailbox: Mutex<Mailbox>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the kernel through `ask` for the budget at `local` and block for the
    /// answer. Returns zero once closed.
    pub fn request(&self, ask: &CrossThreadEvent, local: SimTime, watchdog: Duration) -> SimTime {
        let ticket = {
            let mut mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
            if mailbox.closed {
                return SimTime::ZERO;
            }
            mailbox.requested += 1;
            mailbox.local = local;
            mailbox.requested
        };
        ask.notify();
        let mut mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if mailbox.closed {
                return SimTime::ZERO;
            }
            if mailbox.answered >= ticket {
                return mailbox.budget;
            }
            let (guard, timeout) = self
                .cond
                .wait_timeout(mailbox, watchdog)
                .unwrap_or_else(PoisonError::into_inner);
            mailbox = guard;
            if timeout.timed_out() && !mailbox.closed && mailbox.answered < ticket {
                warn!("no budget answer for ticket {ticket} after {watchdog:?}, asking again");
                ask.notify();
            }
        }
    }

    /// Highest ticket raised so far and the local time it carries.
    pub fn pending(&self) -> (u64, SimTime) {
        let mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        (mailbox.requested, mailbox.local)
    }

    /// Answer every request up to `upto`.
    pub fn answer(&self, upto: u64, budget: SimTime) {
        let mut mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        if upto > mailbox.answered {
            mailbox.answered = upto;
            mailbox.budget = budget;
        }
        self.cond.notify_all();
    }

    /// Release any blocked requester with a zero budget, now and until `reopen`.
    pub fn close(&self) {
        self.mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.cond.notify_all();
    }

    /// Accept requests again. Anything raised before the close counts as answered with zero.
    pub fn reopen(&self) {
        let mut mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        mailbox.closed = false;
        mailbox.answered = mailbox.requested;
        mailbox.budget = SimTime::ZERO;
        self.cond.notify_all();
    }
}
