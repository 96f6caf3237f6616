//! Units of work and the collaborators that supply and acknowledge them.
//!
//! A [`UnitOfWork`] crosses the process boundary by value, so it only carries
//! plain data. The live handle used to acknowledge it (a [`Consumer`]) is looked
//! up on the worker side from a [`ConsumerRegistry`] keyed by queue name.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One job delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub id: String,
    /// Source-specific token needed to acknowledge the delivery.
    pub receipt: String,
    pub queue: String,
    /// Execution deadline in milliseconds; 0 means no deadline.
    pub timeout_ms: u64,
    pub payload: String,
    /// Number of previous delivery attempts.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl UnitOfWork {
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            receipt: id.clone(),
            id,
            queue: queue.into(),
            timeout_ms: 0,
            payload: payload.into(),
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = receipt.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Deadline for one execution, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Errors reported by a [`JobSupply`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupplyError {
    /// Retry on a later cycle.
    #[error("transient supply error: {0}")]
    Transient(String),
    /// The backing resource is gone; the pool shuts down.
    #[error("unrecoverable supply error: {0}")]
    Unrecoverable(String),
}

impl SupplyError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

/// Errors from executing or acknowledging a unit of work.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
    #[error("job exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("no consumer registered for queue '{0}'")]
    UnknownQueue(String),
    #[error("acknowledgement failed: {0}")]
    Ack(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Master-side source of fetched work pending distribution.
#[async_trait]
pub trait JobSupply: Send + Sync {
    /// Return up to `n` units. An empty vec means nothing is available.
    async fn fetch_work(&self, n: usize) -> Result<Vec<UnitOfWork>, SupplyError>;

    /// Hand back units that could not be delivered, for redelivery later.
    async fn return_work(&self, units: Vec<UnitOfWork>) -> Result<(), SupplyError>;

    async fn shutdown(&self);
}

/// Worker-side acknowledgement handle for one queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn complete(&self, unit: &UnitOfWork) -> Result<(), JobError>;

    async fn reject(&self, unit: &UnitOfWork) -> Result<(), JobError>;

    /// Rebuild pooled connections. Called once after the spawn boundary.
    fn reset_connection(&self) {}

    fn is_running(&self) -> bool {
        true
    }

    fn stop(&self) {}
}

/// Queue name → consumer lookup, rebuilt inside each worker.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Arc<dyn Consumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_consumer(mut self, queue: impl Into<String>, consumer: Arc<dyn Consumer>) -> Self {
        self.register(queue, consumer);
        self
    }

    pub fn register(&mut self, queue: impl Into<String>, consumer: Arc<dyn Consumer>) {
        let queue = queue.into();
        if self.consumers.insert(queue.clone(), consumer).is_some() {
            tracing::warn!(%queue, "Replacing consumer registration");
        }
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers.get(queue).cloned()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn reset_connections(&self) {
        for (queue, consumer) in &self.consumers {
            tracing::debug!(%queue, "Resetting consumer connection");
            consumer.reset_connection();
        }
    }

    pub fn stop_all(&self) {
        for consumer in self.consumers.values() {
            consumer.stop();
        }
    }
}

/// In-process [`JobSupply`] backed by a deque.
///
/// Returned units go back to the front so they are redelivered first.
#[derive(Default)]
pub struct MemorySupply {
    pending: StdMutex<VecDeque<UnitOfWork>>,
    returned: StdMutex<Vec<UnitOfWork>>,
    gone: AtomicBool,
    shut_down: AtomicBool,
}

impl MemorySupply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_units(units: impl IntoIterator<Item = UnitOfWork>) -> Self {
        let supply = Self::new();
        supply.push_all(units);
        supply
    }

    pub fn push(&self, unit: UnitOfWork) {
        self.lock_pending().push_back(unit);
    }

    pub fn push_all(&self, units: impl IntoIterator<Item = UnitOfWork>) {
        self.lock_pending().extend(units);
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Every unit ever handed back through [`JobSupply::return_work`].
    pub fn returned(&self) -> Vec<UnitOfWork> {
        self.returned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Simulate the backing queue disappearing.
    pub fn mark_gone(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<UnitOfWork>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobSupply for MemorySupply {
    async fn fetch_work(&self, n: usize) -> Result<Vec<UnitOfWork>, SupplyError> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(SupplyError::Unrecoverable("queue no longer exists".to_string()));
        }
        let mut pending = self.lock_pending();
        let take = n.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn return_work(&self, units: Vec<UnitOfWork>) -> Result<(), SupplyError> {
        {
            let mut returned = self
                .returned
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            returned.extend(units.iter().cloned());
        }
        let mut pending = self.lock_pending();
        for unit in units.into_iter().rev() {
            pending.push_front(unit);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
