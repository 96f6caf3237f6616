//! Pool configuration: defaults, builder methods and environment overlay.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::transport::DEFAULT_SELECT_TIMEOUT;
use crate::distributor::DEFAULT_EMPTY_BACKOFF;
use crate::guard::{DEFAULT_MEMORY_CHECK_CYCLE, GuardLimits};
use crate::manager::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::worker::{DEFAULT_SHUTDOWN_TIMEOUT, WorkerSettings};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker processes kept alive.
    pub workers: usize,
    /// How long stopping workers get before SIGKILL.
    pub shutdown_grace: Duration,
    /// Bound on accept + pid report for a new worker.
    pub handshake_timeout: Duration,
    /// Upper bound on one readiness wait in the assignment loop.
    pub select_timeout: Duration,
    /// Sleep after an empty fetch.
    pub empty_backoff: Duration,
    /// Worker-side readiness wait before rechecking the running flag.
    pub worker_poll_timeout: Duration,
    pub limits: GuardLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            empty_backoff: DEFAULT_EMPTY_BACKOFF,
            worker_poll_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            limits: GuardLimits::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    pub fn with_empty_backoff(mut self, backoff: Duration) -> Self {
        self.empty_backoff = backoff;
        self
    }

    pub fn with_worker_poll_timeout(mut self, timeout: Duration) -> Self {
        self.worker_poll_timeout = timeout;
        self
    }

    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.limits.max_memory = bytes;
        self
    }

    pub fn with_memory_check_cycle(mut self, cycle: u32) -> Self {
        self.limits.memory_check_cycle = cycle;
        self
    }

    pub fn with_max_requests(mut self, n: u64) -> Self {
        self.limits.max_requests = n;
        self
    }

    /// Overlay `FORKPOOL_*` environment variables onto `self`.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.overlay(|var| std::env::var(var).ok())
    }

    /// Overlay values from `lookup`, keyed by environment variable name.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(n) = parse(&lookup, "FORKPOOL_WORKERS")? {
            self.workers = n;
        }
        if let Some(bytes) = parse(&lookup, "FORKPOOL_MAX_MEMORY")? {
            self.limits.max_memory = bytes;
        }
        if let Some(cycle) = parse(&lookup, "FORKPOOL_MEMORY_CHECK_CYCLE")? {
            self.limits.memory_check_cycle = cycle;
        }
        if let Some(n) = parse(&lookup, "FORKPOOL_MAX_REQUESTS")? {
            self.limits.max_requests = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, "FORKPOOL_SHUTDOWN_GRACE_SECS")? {
            self.shutdown_grace = Duration::from_secs(secs);
        }
        if self.limits.memory_check_cycle == 0 {
            self.limits.memory_check_cycle = DEFAULT_MEMORY_CHECK_CYCLE;
        }
        Ok(self)
    }

    /// Settings handed to each spawned worker.
    pub fn worker_settings(&self, endpoint: impl Into<PathBuf>) -> WorkerSettings {
        WorkerSettings::new(endpoint)
            .with_shutdown_timeout(self.worker_poll_timeout)
            .with_limits(self.limits)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_sane() {
        let config = PoolConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.select_timeout, Duration::from_millis(500));
        assert_eq!(config.limits.memory_check_cycle, 16);
        assert_eq!(config.limits.max_memory, 0);
    }

    #[test]
    fn environment_overrides_builder_values() {
        let config = PoolConfig::new(2)
            .with_max_requests(5)
            .overlay(env(&[
                ("FORKPOOL_WORKERS", "8"),
                ("FORKPOOL_MAX_MEMORY", "1048576"),
                ("FORKPOOL_SHUTDOWN_GRACE_SECS", "3"),
            ]))
            .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.limits.max_memory, 1_048_576);
        assert_eq!(config.limits.max_requests, 5);
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = PoolConfig::new(1)
            .overlay(env(&[("FORKPOOL_WORKERS", "many")]))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value for FORKPOOL_WORKERS: \"many\"");
    }

    #[test]
    fn zero_check_cycle_falls_back_to_default() {
        let config = PoolConfig::new(1)
            .overlay(env(&[("FORKPOOL_MEMORY_CHECK_CYCLE", "0")]))
            .unwrap();
        assert_eq!(config.limits.memory_check_cycle, DEFAULT_MEMORY_CHECK_CYCLE);
    }

    #[test]
    fn worker_settings_carry_limits() {
        let settings = PoolConfig::new(1)
            .with_max_memory(4096)
            .with_worker_poll_timeout(Duration::from_millis(200))
            .worker_settings("/tmp/pool.sock");
        assert_eq!(settings.limits.max_memory, 4096);
        assert_eq!(settings.shutdown_timeout(), Duration::from_millis(200));
    }
}
