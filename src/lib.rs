//! `qksync` keeps independently clocked worker threads consistent with a single
//! cooperative discrete-event kernel.
//!
//! Workers advance a private local time through a [`QuantumKeeper`] and
//! reconcile with the kernel at sync points chosen by a pluggable sync policy.
//! Cross-thread signalling goes through [`CrossThreadEvent`], kernel-only work
//! through [`MainThreadDispatcher`], and [`SuspendRegistry`] stops the kernel
//! from going idle while a worker is still expected to produce activity.

use thiserror::Error;

pub mod config;
pub mod context;
pub mod keeper;
pub mod kernel;
pub mod sync;
pub mod time;

pub use config::{KeeperConfig, PolicyKind, SimConfig, ThreadType};
pub use context::SimContext;
pub use keeper::{create_keeper, KeeperState, KeeperStatus, QuantumKeeper};
pub use kernel::{clock::KernelClock, EventId, KernelView, ProcessId, RunOutcome, Scheduler};
pub use sync::{
    async_event::CrossThreadEvent, dispatch::MainThreadDispatcher, pause::SuspendRegistry,
    realtime::RealtimeLimiter,
};
pub use time::SimTime;

/// Error enum to provide feedback on synchronization failures
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("keeper `{0}` is not running")]
    NotRunning(String),
    #[error("keeper `{0}` is already running")]
    AlreadyRunning(String),
    #[error("`{0}` may only be called on the kernel thread")]
    NotKernelThread(&'static str),
    #[error("`{0}` may not be called on the kernel thread")]
    KernelThreadForbidden(&'static str),
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("unknown sync policy `{0}`")]
    UnknownPolicy(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("the global quantum is frozen once a keeper has started")]
    QuantumFrozen,
    #[error("job was cancelled before the kernel ran it")]
    Cancelled,
    #[error("worker thread panicked")]
    ThreadPanic,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SyncError {
    /// Contract violations are bugs at the call site and should end the
    /// calling thread, everything else is an operational condition.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SyncError::NotRunning(_)
                | SyncError::AlreadyRunning(_)
                | SyncError::NotKernelThread(_)
                | SyncError::KernelThreadForbidden(_)
                | SyncError::ContractViolation(_)
        )
    }
}
