//! Filesystem spool queue.
//!
//! Layout under the spool root:
//!
//! ```text
//! <root>/<queue>/<id>.json             pending
//! <root>/<queue>/.inflight/<id>.json   claimed by the master, not yet acknowledged
//! <root>/<queue>/.dead/<id>.json       unreadable entries
//! ```
//!
//! Claims are atomic renames, so a unit is owned by exactly one directory at
//! a time. Ids sort by creation time.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forkpool::{Consumer, JobError, JobSupply, SupplyError, UnitOfWork};
use serde::{Deserialize, Serialize};

const INFLIGHT_DIR: &str = ".inflight";
const DEAD_DIR: &str = ".dead";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolEntry {
    payload: String,
    #[serde(default)]
    attempts: u32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FsSpool {
    queue: String,
    pending: PathBuf,
    inflight: PathBuf,
    dead: PathBuf,
    timeout: Duration,
}

impl FsSpool {
    /// Open (creating if needed) `queue` under `root`.
    pub fn open(root: &Path, queue: &str) -> io::Result<Self> {
        let pending = root.join(queue);
        let inflight = pending.join(INFLIGHT_DIR);
        let dead = pending.join(DEAD_DIR);
        std::fs::create_dir_all(&inflight)?;
        std::fs::create_dir_all(&dead)?;
        Ok(Self {
            queue: queue.to_string(),
            pending,
            inflight,
            dead,
            timeout: Duration::ZERO,
        })
    }

    /// Deadline stamped on every fetched unit. Zero means none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn pending_path(&self, id: &str) -> PathBuf {
        self.pending.join(format!("{}.json", id))
    }

    fn inflight_path(&self, id: &str) -> PathBuf {
        self.inflight.join(format!("{}.json", id))
    }

    /// Write a new pending entry and return its id.
    pub fn enqueue(&self, payload: impl Into<String>) -> io::Result<String> {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%S%6f"),
            uuid::Uuid::new_v4().simple()
        );
        let entry = SpoolEntry {
            payload: payload.into(),
            attempts: 0,
            created_at,
        };
        let bytes = serde_json::to_vec(&entry).map_err(io::Error::other)?;

        // Hidden temp name so fetchers never see a partial file.
        let tmp = self.pending.join(format!(".{}.tmp", id));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.pending_path(&id))?;
        tracing::debug!(job_id = %id, queue = %self.queue, "Enqueued unit");
        Ok(id)
    }

    /// Move everything left in flight by a previous run back to pending.
    pub fn recover_inflight(&self) -> io::Result<usize> {
        let mut recovered = 0;
        for entry in std::fs::read_dir(&self.inflight)? {
            let path = entry?.path();
            if let Some(name) = path.file_name() {
                std::fs::rename(&path, self.pending.join(name))?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, queue = %self.queue, "Recovered in-flight units");
        }
        Ok(recovered)
    }

    /// Pending entry ids, oldest first.
    pub async fn pending_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.pending).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn claim(&self, id: &str) -> Result<Option<UnitOfWork>, SupplyError> {
        let claimed = self.inflight_path(id);
        match tokio::fs::rename(self.pending_path(id), &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SupplyError::Transient(format!("claim {}: {}", id, e))),
        }

        let raw = match tokio::fs::read(&claimed).await {
            Ok(raw) => raw,
            Err(_) if tokio::fs::metadata(&claimed).await.is_ok_and(|m| m.is_dir()) => {
                tracing::error!(job_id = %id, "Spool entry is a directory, moving aside");
                self.bury(id).await;
                return Ok(None);
            }
            Err(e) => {
                // Leave it pending for a later fetch.
                if let Err(release) = self.release(id).await {
                    tracing::error!(
                        job_id = %id,
                        error = %release,
                        "Failed to release unreadable unit",
                    );
                }
                return Err(SupplyError::Transient(format!("read {}: {}", id, e)));
            }
        };
        let entry: SpoolEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Unreadable spool entry, moving aside");
                self.bury(id).await;
                return Ok(None);
            }
        };

        Ok(Some(UnitOfWork {
            id: id.to_string(),
            receipt: claimed.display().to_string(),
            queue: self.queue.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
            payload: entry.payload,
            attempts: entry.attempts,
            created_at: entry.created_at,
        }))
    }

    async fn release(&self, id: &str) -> io::Result<()> {
        tokio::fs::rename(self.inflight_path(id), self.pending_path(id)).await
    }

    /// Move a claimed entry into the dead-letter directory.
    async fn bury(&self, id: &str) {
        let dead = self.dead.join(format!("{}.json", id));
        if let Err(e) = tokio::fs::rename(self.inflight_path(id), &dead).await {
            tracing::error!(
                job_id = %id,
                error = %e,
                path = %dead.display(),
                "Failed to move spool entry aside, it stays in flight"
            );
        }
    }
}

#[async_trait]
impl JobSupply for FsSpool {
    async fn fetch_work(&self, n: usize) -> Result<Vec<UnitOfWork>, SupplyError> {
        if !tokio::fs::try_exists(&self.pending).await.unwrap_or(false) {
            return Err(SupplyError::Unrecoverable(format!(
                "queue directory {} no longer exists",
                self.pending.display()
            )));
        }

        let ids = self
            .pending_ids()
            .await
            .map_err(|e| SupplyError::Transient(format!("list {}: {}", self.queue, e)))?;

        let mut units = Vec::with_capacity(n.min(ids.len()));
        for id in ids {
            if units.len() == n {
                break;
            }
            match self.claim(&id).await {
                Ok(Some(unit)) => units.push(unit),
                Ok(None) => {}
                // Units already claimed would otherwise sit in flight until restart.
                Err(e) if !units.is_empty() => {
                    tracing::warn!(
                        error = %e,
                        claimed = units.len(),
                        "Claim failed, handing out what was already claimed"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(units)
    }

    async fn return_work(&self, units: Vec<UnitOfWork>) -> Result<(), SupplyError> {
        let mut failed = Vec::new();
        for unit in units {
            if let Err(e) = self.release(&unit.id).await {
                tracing::error!(job_id = %unit.id, error = %e, "Failed to return unit to spool");
                failed.push(unit.id);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SupplyError::Transient(format!(
                "could not return {} units: {}",
                failed.len(),
                failed.join(", ")
            )))
        }
    }

    async fn shutdown(&self) {
        tracing::info!(queue = %self.queue, "Spool supply shut down");
    }
}

#[async_trait]
impl Consumer for FsSpool {
    async fn complete(&self, unit: &UnitOfWork) -> Result<(), JobError> {
        tokio::fs::remove_file(self.inflight_path(&unit.id))
            .await
            .map_err(|e| JobError::Ack(format!("complete {}: {}", unit.id, e)))
    }

    /// Back to pending with one more recorded attempt.
    async fn reject(&self, unit: &UnitOfWork) -> Result<(), JobError> {
        let entry = SpoolEntry {
            payload: unit.payload.clone(),
            attempts: unit.attempts + 1,
            created_at: unit.created_at,
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| JobError::Ack(e.to_string()))?;
        let claimed = self.inflight_path(&unit.id);
        tokio::fs::write(&claimed, bytes).await?;
        tokio::fs::rename(&claimed, self.pending_path(&unit.id))
            .await
            .map_err(|e| JobError::Ack(format!("reject {}: {}", unit.id, e)))
    }
}
