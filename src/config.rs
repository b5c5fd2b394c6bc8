use std::time::Duration;

use strum::{Display, EnumIter, EnumString};

use crate::{SimTime, SyncError};

/// Name-keyed selector for the sync policy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum PolicyKind {
    #[strum(to_string = "bounded-quantum")]
    BoundedQuantum,
    #[strum(to_string = "adaptive")]
    AdaptiveQuantum,
    #[strum(to_string = "rolling")]
    Rolling,
    #[strum(to_string = "unconstrained")]
    Unconstrained,
    #[strum(to_string = "freerunning")]
    FreeRunning,
}

/// Where a keeper's job runs once `start` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadType {
    /// A one-shot kernel process started with `start_on_kernel`.
    KernelThread,
    /// A dedicated OS thread per keeper.
    #[default]
    OsThread,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub quantum: SimTime,
    pub park_slice: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            quantum: SimTime::from_ms(1),
            park_slice: Duration::from_millis(250),
        }
    }
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the process-wide quantum every keeper reads
    pub fn with_quantum(mut self, quantum: SimTime) -> Self {
        self.quantum = quantum;
        self
    }

    /// Upper bound on a single park of the kernel before it re-checks its state
    pub fn with_park_slice(mut self, park_slice: Duration) -> Self {
        self.park_slice = park_slice;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.quantum.is_zero() {
            return Err(SyncError::ConfigError(
                "Quantum must be positive".to_string(),
            ));
        }
        if self.park_slice.is_zero() {
            return Err(SyncError::ConfigError(
                "Park slice must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub name: String,
    pub policy: PolicyKind,
    pub thread_type: ThreadType,
    pub watchdog: Duration,
}

impl KeeperConfig {
    /// Create a configuration for the given policy with default naming and a one second watchdog
    pub fn new(policy: PolicyKind) -> Self {
        Self {
            name: format!("keeper.{policy}"),
            policy,
            thread_type: ThreadType::default(),
            watchdog: Duration::from_secs(1),
        }
    }

    /// Parse a policy name (`"bounded-quantum"`, `"adaptive"`, `"rolling"`, `"unconstrained"`, `"freerunning"`)
    pub fn from_name(name: &str) -> Result<Self, SyncError> {
        let policy = name
            .parse::<PolicyKind>()
            .map_err(|_| SyncError::UnknownPolicy(name.to_string()))?;
        Ok(Self::new(policy))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_thread_type(mut self, thread_type: ThreadType) -> Self {
        self.thread_type = thread_type;
        self
    }

    /// How long a blocked worker waits before nudging the kernel again
    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.name.is_empty() {
            return Err(SyncError::ConfigError(
                "Keeper name must not be empty".to_string(),
            ));
        }
        if self.watchdog.is_zero() {
            return Err(SyncError::ConfigError(
                "Watchdog interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod config_tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_policy_names_parse_both_ways() {
        for kind in PolicyKind::iter() {
            let parsed: PolicyKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!(
            "bounded-quantum".parse::<PolicyKind>().unwrap(),
            PolicyKind::BoundedQuantum
        );
        assert_eq!(PolicyKind::FreeRunning.to_string(), "freerunning");
    }

    #[test]
    fn test_unknown_policy_name() {
        let err = KeeperConfig::from_name("lockstep").unwrap_err();
        assert!(matches!(err, SyncError::UnknownPolicy(name) if name == "lockstep"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(SimConfig::new().validate().is_ok());
        assert!(SimConfig::new()
            .with_quantum(SimTime::ZERO)
            .validate()
            .is_err());
        assert!(KeeperConfig::new(PolicyKind::Rolling)
            .with_watchdog(Duration::ZERO)
            .validate()
            .is_err());
        assert!(KeeperConfig::new(PolicyKind::Rolling)
            .with_name("")
            .validate()
            .is_err());
        let cfg = KeeperConfig::from_name("adaptive").unwrap();
        assert_eq!(cfg.name, "keeper.adaptive");
        assert_eq!(cfg.thread_type, ThreadType::OsThread);
    }
}
