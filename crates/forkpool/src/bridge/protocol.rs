//! Wire payload types for master/worker communication.
//!
//! One socket per worker, two directions:
//! - **worker → master**: a single [`WorkerHello`] frame (pid handshake), then
//!   bare readiness tokens (see [`super::transport::READY_TOKEN`])
//! - **master → worker**: [`DispatchRequest`] frames

use serde::{Deserialize, Serialize};

use crate::job::UnitOfWork;

/// First frame a worker sends after connecting: its own pid.
///
/// The master matches the pid against its spawn table before attaching the
/// socket to that worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHello {
    pub pid: u32,
}

/// Messages from master to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchRequest {
    /// Execute these units sequentially, then signal readiness once.
    Perform { units: Vec<UnitOfWork> },
}

impl DispatchRequest {
    pub fn perform(units: Vec<UnitOfWork>) -> Self {
        Self::Perform { units }
    }

    pub fn units(&self) -> &[UnitOfWork] {
        match self {
            Self::Perform { units } => units,
        }
    }

    pub fn into_units(self) -> Vec<UnitOfWork> {
        match self {
            Self::Perform { units } => units,
        }
    }
}
