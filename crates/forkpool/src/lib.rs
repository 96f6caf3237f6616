//! forkpool: a preforked worker pool for background job processing.
//!
//! The master keeps a fixed number of long-lived worker processes, hands
//! them units of work over per-worker Unix sockets and replaces any that die.

mod version;

pub mod bridge;
pub mod config;
pub mod distributor;
pub mod guard;
pub mod job;
pub mod manager;
pub mod orchestrator;
pub mod signals;
pub mod termination;
pub mod wakeup;
pub mod worker;

pub use config::{ConfigError, PoolConfig};
pub use distributor::{Assignment, DistributorError, WorkDistributor};
pub use guard::{GuardLimits, GuardTrip, ResourceGuard};
pub use job::{
    Consumer, ConsumerRegistry, JobError, JobSupply, MemorySupply, SupplyError, UnitOfWork,
};
pub use manager::{
    ExecSpawner, INTERNAL_WORKER_FLAG, ManagerError, SpawnError, WorkerHandle, WorkerManager,
    WorkerSpawner,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorHandle};
pub use signals::SignalDispatcher;
pub use termination::TerminationReason;
pub use version::{FORKPOOL_VERSION, PROTOCOL_VERSION, VersionInfo};
pub use worker::{JobHandler, WorkerExit, WorkerLoop, WorkerSettings, run_worker};
