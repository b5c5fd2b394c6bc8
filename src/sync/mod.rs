//! Primitives that cross the boundary between worker threads and the kernel thread.

pub mod async_event;
pub mod dispatch;
pub mod pause;
pub mod realtime;
pub(crate) mod rendezvous;
