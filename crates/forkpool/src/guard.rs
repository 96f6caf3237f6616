//! Post-job resource ceilings for long-lived workers.
//!
//! A worker that grows past its memory ceiling or has served its quota of
//! requests terminates itself with a success status; the master's respawn
//! path restores pool capacity.

use serde::{Deserialize, Serialize};

/// Default number of `check_memory` calls between RSS samples.
pub const DEFAULT_MEMORY_CHECK_CYCLE: u32 = 16;

/// Ceilings enforced by [`ResourceGuard`]. Zero disables a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardLimits {
    /// Resident set size ceiling in bytes.
    pub max_memory: u64,
    /// Sample memory on every Nth check.
    pub memory_check_cycle: u32,
    /// Requests served before the worker retires.
    pub max_requests: u64,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            max_memory: 0,
            memory_check_cycle: DEFAULT_MEMORY_CHECK_CYCLE,
            max_requests: 0,
        }
    }
}

/// Why a guard check ended the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardTrip {
    Memory { rss: u64, limit: u64 },
    Requests { served: u64, limit: u64 },
}

impl std::fmt::Display for GuardTrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardTrip::Memory { rss, limit } => {
                write!(f, "resident memory {} bytes exceeds {} bytes", rss, limit)
            }
            GuardTrip::Requests { served, limit } => {
                write!(f, "served {} of {} allowed requests", served, limit)
            }
        }
    }
}

type Sampler = Box<dyn Fn() -> Option<u64> + Send + Sync>;
type Hook = Box<dyn FnMut(GuardTrip) + Send + Sync>;

pub struct ResourceGuard {
    limits: GuardLimits,
    memory_checks: u64,
    requests: u64,
    terminated: bool,
    sampler: Sampler,
    notify: Option<Hook>,
    exit: Hook,
}

impl ResourceGuard {
    /// Guard that samples the real RSS and exits the process with status 0.
    pub fn new(limits: GuardLimits) -> Self {
        Self {
            limits,
            memory_checks: 0,
            requests: 0,
            terminated: false,
            sampler: Box::new(resident_memory),
            notify: None,
            exit: Box::new(|_| std::process::exit(0)),
        }
    }

    pub fn with_sampler(
        mut self,
        sampler: impl Fn() -> Option<u64> + Send + Sync + 'static,
    ) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Called before exiting, e.g. to report the trip upstream.
    pub fn with_notify(mut self, notify: impl FnMut(GuardTrip) + Send + Sync + 'static) -> Self {
        self.notify = Some(Box::new(notify));
        self
    }

    pub fn with_exit(mut self, exit: impl FnMut(GuardTrip) + Send + Sync + 'static) -> Self {
        self.exit = Box::new(exit);
        self
    }

    pub fn limits(&self) -> &GuardLimits {
        &self.limits
    }

    pub fn requests_served(&self) -> u64 {
        self.requests
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Sample memory on every Nth call. Returns true if the ceiling tripped.
    pub fn check_memory(&mut self) -> bool {
        if self.terminated || self.limits.max_memory == 0 {
            return false;
        }

        self.memory_checks += 1;
        let cycle = u64::from(self.limits.memory_check_cycle.max(1));
        if self.memory_checks % cycle != 0 {
            return false;
        }

        let Some(rss) = (self.sampler)() else {
            tracing::debug!("Resident memory unavailable, skipping check");
            return false;
        };
        tracing::trace!(rss, limit = self.limits.max_memory, "Memory check");
        if rss <= self.limits.max_memory {
            return false;
        }

        self.trip(GuardTrip::Memory {
            rss,
            limit: self.limits.max_memory,
        });
        true
    }

    /// Count one served request. Returns true on the request that hits the ceiling.
    pub fn check_requests(&mut self) -> bool {
        if self.terminated || self.limits.max_requests == 0 {
            return false;
        }

        self.requests += 1;
        if self.requests < self.limits.max_requests {
            return false;
        }

        self.trip(GuardTrip::Requests {
            served: self.requests,
            limit: self.limits.max_requests,
        });
        true
    }

    fn trip(&mut self, trip: GuardTrip) {
        self.terminated = true;
        tracing::warn!(
            pid = std::process::id(),
            reason = %trip,
            "Worker exceeded resource ceiling, exiting",
        );
        if let Some(notify) = self.notify.as_mut() {
            notify(trip);
        }
        (self.exit)(trip);
    }
}

/// Current resident set size in bytes.
///
/// Reads `/proc/self/statm` where available and falls back to the peak RSS
/// reported by `getrusage`.
pub fn resident_memory() -> Option<u64> {
    statm_rss().or_else(peak_rss)
}

fn statm_rss() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(page_size).ok().map(|size| pages * size)
}

fn peak_rss() -> Option<u64> {
    use nix::sys::resource::{UsageWho, getrusage};

    let max_rss = u64::try_from(getrusage(UsageWho::RUSAGE_SELF).ok()?.max_rss()).ok()?;

    #[cfg(target_os = "macos")]
    {
        // macOS: bytes
        Some(max_rss)
    }

    #[cfg(not(target_os = "macos"))]
    {
        // Linux: kilobytes
        Some(max_rss * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_exit(guard: ResourceGuard) -> (ResourceGuard, Arc<AtomicU32>) {
        let exits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&exits);
        let guard = guard.with_exit(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (guard, exits)
    }

    #[test]
    fn memory_over_ceiling_exits_once() {
        let limits = GuardLimits {
            max_memory: 1024,
            memory_check_cycle: 1,
            max_requests: 0,
        };
        let notified = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&notified);
        let (mut guard, exits) = counting_exit(
            ResourceGuard::new(limits)
                .with_sampler(|| Some(4096))
                .with_notify(move |trip| {
                    assert_eq!(trip, GuardTrip::Memory { rss: 4096, limit: 1024 });
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        );

        assert!(guard.check_memory());
        assert!(!guard.check_memory());
        assert!(!guard.check_requests());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(guard.is_terminated());
    }

    #[test]
    fn memory_is_sampled_every_nth_call() {
        let samples = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&samples);
        let limits = GuardLimits {
            max_memory: 1 << 30,
            memory_check_cycle: 4,
            max_requests: 0,
        };
        let (mut guard, exits) = counting_exit(ResourceGuard::new(limits).with_sampler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(1)
        }));

        for _ in 0..8 {
            assert!(!guard.check_memory());
        }
        assert_eq!(samples.load(Ordering::SeqCst), 2);
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn request_ceiling_exits_on_the_hundredth_call() {
        let limits = GuardLimits {
            max_requests: 100,
            ..GuardLimits::default()
        };
        let (mut guard, exits) = counting_exit(ResourceGuard::new(limits));

        for call in 1..=99 {
            assert!(!guard.check_requests(), "tripped early on call {}", call);
        }
        assert_eq!(exits.load(Ordering::SeqCst), 0);
        assert!(guard.check_requests());
        assert_eq!(exits.load(Ordering::SeqCst), 1);

        assert!(!guard.check_requests());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_limits_disable_checks() {
        let guard = ResourceGuard::new(GuardLimits::default()).with_sampler(|| Some(u64::MAX));
        let (mut guard, exits) = counting_exit(guard);
        for _ in 0..1000 {
            guard.check_memory();
            guard.check_requests();
        }
        assert_eq!(exits.load(Ordering::SeqCst), 0);
        assert_eq!(guard.requests_served(), 0);
    }

    #[test]
    fn resident_memory_is_nonzero() {
        assert!(resident_memory().is_some_and(|rss| rss > 0));
    }
}
