//! Pushes fetched work to ready workers.
//!
//! Assignment is positional: unit *i* goes to worker *i*. A unit that cannot
//! be pushed is handed back to the supply, never dropped.

use std::io;
use std::time::Duration;

use crate::bridge::protocol::DispatchRequest;
use crate::bridge::transport::{clear_ready, send_message};
use crate::job::{JobSupply, SupplyError, UnitOfWork};
use crate::manager::WorkerHandle;

/// Pause after an empty fetch.
pub const DEFAULT_EMPTY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error("supply returned {units} units for {workers} ready workers")]
    TooManyUnits { units: usize, workers: usize },
    #[error(transparent)]
    Supply(#[from] SupplyError),
}

/// Outcome of one distribution cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// `(worker pid, unit id)` for every unit pushed.
    pub assigned: Vec<(u32, String)>,
    /// Ids of units handed back to the supply.
    pub returned: Vec<String>,
}

impl Assignment {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.returned.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WorkDistributor {
    empty_backoff: Duration,
}

impl Default for WorkDistributor {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkDistributor {
    pub fn new() -> Self {
        Self {
            empty_backoff: DEFAULT_EMPTY_BACKOFF,
        }
    }

    pub fn with_empty_backoff(mut self, backoff: Duration) -> Self {
        self.empty_backoff = backoff;
        self
    }

    /// Fetch up to one unit per worker and push them out.
    pub async fn fetch_and_assign(
        &self,
        workers: &mut [&mut WorkerHandle],
        supply: &dyn JobSupply,
    ) -> Result<Assignment, DistributorError> {
        let mut report = Assignment::default();
        if workers.is_empty() {
            return Ok(report);
        }

        let units = supply.fetch_work(workers.len()).await?;
        if units.is_empty() {
            tracing::trace!(backoff = ?self.empty_backoff, "No work available");
            tokio::time::sleep(self.empty_backoff).await;
            return Ok(report);
        }

        if units.len() > workers.len() {
            let err = DistributorError::TooManyUnits {
                units: units.len(),
                workers: workers.len(),
            };
            tracing::error!(error = %err, "Supply over-delivered, returning all units");
            supply.return_work(units).await?;
            return Err(err);
        }

        let mut undeliverable = Vec::new();
        for (unit, worker) in units.into_iter().zip(workers.iter_mut()) {
            let pid = worker.pid();
            match push(worker, &unit).await {
                Ok(()) => {
                    tracing::debug!(pid, job_id = %unit.id, queue = %unit.queue, "Assigned unit");
                    report.assigned.push((pid, unit.id));
                }
                Err(e) => {
                    tracing::warn!(
                        pid,
                        job_id = %unit.id,
                        error = %e,
                        "Failed to push unit, returning it",
                    );
                    undeliverable.push(unit);
                }
            }
        }

        if !undeliverable.is_empty() {
            report.returned = undeliverable.iter().map(|u| u.id.clone()).collect();
            supply.return_work(undeliverable).await?;
        }
        Ok(report)
    }
}

async fn push(worker: &mut WorkerHandle, unit: &UnitOfWork) -> io::Result<()> {
    let socket = worker
        .socket_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "worker has no socket"))?;

    if !clear_ready(socket).await? {
        return Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "worker has not signalled readiness",
        ));
    }
    send_message(socket, DispatchRequest::perform(vec![unit.clone()])).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::{READY_TOKEN, recv_message};
    use crate::job::MemorySupply;
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    fn units(ids: &[&str]) -> Vec<UnitOfWork> {
        ids.iter()
            .map(|id| UnitOfWork::new(*id, "default", format!("payload-{}", id)))
            .collect()
    }

    /// A worker whose far end has already announced readiness.
    async fn ready_worker(pid: u32) -> (WorkerHandle, UnixStream) {
        let (master, mut far) = UnixStream::pair().unwrap();
        far.write_all(READY_TOKEN).await.unwrap();
        master.readable().await.unwrap();
        (WorkerHandle::attached(pid, master), far)
    }

    fn distributor() -> WorkDistributor {
        WorkDistributor::new().with_empty_backoff(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn assignment_is_bounded_by_ready_workers() {
        let supply = MemorySupply::with_units(units(&["a", "b", "c"]));
        let (mut w1, mut far1) = ready_worker(101).await;
        let (mut w2, mut far2) = ready_worker(102).await;

        let report = distributor()
            .fetch_and_assign(&mut [&mut w1, &mut w2], &supply)
            .await
            .unwrap();

        assert_eq!(
            report.assigned,
            vec![(101, "a".to_string()), (102, "b".to_string())]
        );
        assert!(report.returned.is_empty());
        assert_eq!(supply.pending_len(), 1);

        let first: DispatchRequest = recv_message(&mut far1).await.unwrap();
        assert_eq!(first.units()[0].id, "a");
        let second: DispatchRequest = recv_message(&mut far2).await.unwrap();
        assert_eq!(second.units()[0].id, "b");
    }

    #[tokio::test]
    async fn failed_push_returns_exactly_that_unit() {
        let supply = MemorySupply::with_units(units(&["ok", "lost"]));
        let (mut healthy, _far) = ready_worker(201).await;
        let (master, far) = UnixStream::pair().unwrap();
        drop(far);
        master.readable().await.unwrap();
        let mut dead = WorkerHandle::attached(202, master);

        let report = distributor()
            .fetch_and_assign(&mut [&mut healthy, &mut dead], &supply)
            .await
            .unwrap();

        assert_eq!(report.assigned, vec![(201, "ok".to_string())]);
        assert_eq!(report.returned, vec!["lost".to_string()]);
        let returned: Vec<String> = supply.returned().into_iter().map(|u| u.id).collect();
        assert_eq!(returned, vec!["lost"]);
        assert_eq!(supply.pending_len(), 1);
    }

    #[tokio::test]
    async fn worker_without_token_gets_nothing() {
        let supply = MemorySupply::with_units(units(&["x"]));
        let (master, _far) = UnixStream::pair().unwrap();
        let mut silent = WorkerHandle::attached(301, master);

        let report = distributor()
            .fetch_and_assign(&mut [&mut silent], &supply)
            .await
            .unwrap();

        assert!(report.assigned.is_empty());
        assert_eq!(report.returned, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn empty_supply_backs_off() {
        let supply = MemorySupply::new();
        let (mut worker, _far) = ready_worker(401).await;

        let report = distributor()
            .fetch_and_assign(&mut [&mut worker], &supply)
            .await
            .unwrap();
        assert!(report.is_empty());
    }

    struct Overdelivering(MemorySupply);

    #[async_trait]
    impl JobSupply for Overdelivering {
        async fn fetch_work(&self, _n: usize) -> Result<Vec<UnitOfWork>, SupplyError> {
            self.0.fetch_work(usize::MAX).await
        }

        async fn return_work(&self, units: Vec<UnitOfWork>) -> Result<(), SupplyError> {
            self.0.return_work(units).await
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn more_units_than_workers_fails_without_losing_work() {
        let supply = Overdelivering(MemorySupply::with_units(units(&["a", "b"])));
        let (mut worker, _far) = ready_worker(501).await;

        let err = distributor()
            .fetch_and_assign(&mut [&mut worker], &supply)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DistributorError::TooManyUnits {
                units: 2,
                workers: 1
            }
        ));
        assert_eq!(supply.0.pending_len(), 2);
    }

    #[tokio::test]
    async fn gone_supply_is_unrecoverable() {
        let supply = MemorySupply::new();
        supply.mark_gone();
        let (mut worker, _far) = ready_worker(601).await;

        let err = distributor()
            .fetch_and_assign(&mut [&mut worker], &supply)
            .await
            .unwrap_err();
        assert!(matches!(err, DistributorError::Supply(e) if e.is_unrecoverable()));
    }
}
