//! Pool orchestrator: owns the worker manager and drives the assignment loop.
//!
//! Signals never touch pool state directly. The dispatcher thread writes a
//! code byte to the wakeup channel and the loop acts on it after waking, so
//! the pid/socket maps have exactly one writer.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::Signal;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bridge::transport::{
    Endpoint, Probe, create_listening_socket, is_writable, probe, select_ready,
};
use crate::config::PoolConfig;
use crate::distributor::{DistributorError, WorkDistributor};
use crate::job::{JobSupply, SupplyError};
use crate::manager::{ExecSpawner, ManagerError, WorkerManager, WorkerSpawner};
use crate::signals::SignalDispatcher;
use crate::wakeup::{SignalCode, WakeupReceiver, WakeupSender, wakeup_channel};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to bind worker endpoint: {0}")]
    Endpoint(#[source] io::Error),
    #[error("failed to install signal handling: {0}")]
    Signals(#[source] io::Error),
    #[error("failed to locate worker executable: {0}")]
    Executable(#[source] io::Error),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Supply(#[from] SupplyError),
    #[error("readiness wait failed: {0}")]
    Select(#[source] io::Error),
    #[error("assignment loop panicked")]
    Panicked,
}

type ReopenLogs = Arc<dyn Fn() + Send + Sync>;

pub struct OrchestratorConfig {
    pub pool: PoolConfig,
    pub spawner: Option<Arc<dyn WorkerSpawner>>,
    /// Listening socket path; defaults to one derived from our pid.
    pub endpoint: Option<PathBuf>,
    /// Install OS signal handlers for child-exit, shutdown and log reopen.
    pub trap_signals: bool,
    pub reopen_logs: Option<ReopenLogs>,
}

impl OrchestratorConfig {
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            pool,
            spawner: None,
            endpoint: None,
            trap_signals: true,
            reopen_logs: None,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_endpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.endpoint = Some(path.into());
        self
    }

    pub fn with_signals(mut self, trap: bool) -> Self {
        self.trap_signals = trap;
        self
    }

    pub fn with_reopen_logs(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.reopen_logs = Some(Arc::new(hook));
        self
    }
}

pub struct Orchestrator;

impl Orchestrator {
    /// Bind the endpoint, bring the pool to size and start the assignment
    /// loop in the background.
    pub async fn start(
        config: OrchestratorConfig,
        supply: Arc<dyn JobSupply>,
    ) -> Result<OrchestratorHandle, OrchestratorError> {
        let endpoint = match &config.endpoint {
            Some(path) => Endpoint::bind(path.clone()),
            None => create_listening_socket(),
        }
        .map_err(OrchestratorError::Endpoint)?;
        let endpoint_path = endpoint.path().to_path_buf();

        let spawner = match config.spawner {
            Some(spawner) => spawner,
            None => Arc::new(ExecSpawner::current_exe().map_err(OrchestratorError::Executable)?),
        };

        let (wake_tx, wakeup) = wakeup_channel().map_err(OrchestratorError::Signals)?;
        let dispatcher = SignalDispatcher::new();
        if config.trap_signals {
            for code in SignalCode::ALL {
                let tx = wake_tx.clone();
                dispatcher
                    .trap(code.signal(), move |signal| {
                        if let Err(e) = tx.notify(code) {
                            tracing::warn!(?signal, error = %e, "Failed to wake assignment loop");
                        }
                    })
                    .map_err(OrchestratorError::Signals)?;
            }
        }

        let pool = config.pool;
        let settings = pool.worker_settings(&endpoint_path);
        let mut manager = WorkerManager::new(endpoint, spawner, settings, pool.workers)
            .with_handshake_timeout(pool.handshake_timeout);

        tracing::info!(
            workers = pool.workers,
            endpoint = %endpoint_path.display(),
            "Starting worker pool",
        );
        if let Err(e) = manager.create_and_attach_workers().await {
            dispatcher.reset();
            manager.stop_workers(Signal::SIGTERM, pool.shutdown_grace).await;
            return Err(e.into());
        }
        tracing::info!(attached = manager.attached_count(), "Worker pool ready");

        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let distributor = WorkDistributor::new().with_empty_backoff(pool.empty_backoff);

        let assignment = AssignmentLoop {
            pool,
            manager,
            distributor,
            supply,
            dispatcher,
            wakeup,
            _wake_tx: wake_tx,
            running: Arc::clone(&running),
            shutdown_tx,
            reopen_logs: config.reopen_logs,
        };
        let task = tokio::spawn(assignment.run());

        Ok(OrchestratorHandle {
            running,
            shutdown_rx,
            endpoint: endpoint_path,
            task,
        })
    }
}

/// Handle to a started pool.
pub struct OrchestratorHandle {
    running: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
    endpoint: PathBuf,
    task: JoinHandle<Result<(), OrchestratorError>>,
}

impl OrchestratorHandle {
    /// Ask the loop to exit. Workers are drained by the loop itself.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flips to `true` once workers are stopped and the supply is shut down.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn endpoint(&self) -> &std::path::Path {
        &self.endpoint
    }

    /// Wait for the loop to finish.
    pub async fn join(self) -> Result<(), OrchestratorError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Assignment loop task failed");
                Err(OrchestratorError::Panicked)
            }
        }
    }
}

enum SocketState {
    Live,
    Skip,
    Dead,
}

fn classify(socket: &UnixStream) -> SocketState {
    match probe(socket) {
        Ok(Probe::Pending) if is_writable(socket) => SocketState::Live,
        Ok(Probe::Pending) | Ok(Probe::Idle) => SocketState::Skip,
        Ok(Probe::Closed) => SocketState::Dead,
        Err(e) => {
            tracing::debug!(error = %e, "Worker socket probe failed");
            SocketState::Dead
        }
    }
}

struct AssignmentLoop {
    pool: PoolConfig,
    manager: WorkerManager,
    distributor: WorkDistributor,
    supply: Arc<dyn JobSupply>,
    dispatcher: SignalDispatcher,
    wakeup: WakeupReceiver,
    /// Keeps the wakeup channel open when no signal handler holds a sender.
    _wake_tx: WakeupSender,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    reopen_logs: Option<ReopenLogs>,
}

impl AssignmentLoop {
    async fn run(mut self) -> Result<(), OrchestratorError> {
        let result = self.serve().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Assignment loop failed, shutting down");
        }

        self.dispatcher.reset();
        self.manager
            .stop_workers(Signal::SIGTERM, self.pool.shutdown_grace)
            .await;
        self.supply.shutdown().await;
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        tracing::info!("Worker pool stopped");
        result
    }

    async fn serve(&mut self) -> Result<(), OrchestratorError> {
        while self.running.load(Ordering::Acquire) {
            let (ready_fds, woken) = {
                let sockets = self.manager.sockets();
                let streams: Vec<&UnixStream> = sockets.iter().map(|(_, s)| *s).collect();
                let wakeup = Some(self.wakeup.stream());
                let readiness = select_ready(&streams, wakeup, self.pool.select_timeout)
                    .await
                    .map_err(OrchestratorError::Select)?;
                match readiness {
                    Some(r) => {
                        let fds: Vec<RawFd> = r.readable.iter().map(|&i| sockets[i].0).collect();
                        (fds, r.wakeup)
                    }
                    None => (Vec::new(), false),
                }
            };

            if woken {
                self.handle_signals().await;
            } else if ready_fds.is_empty() {
                self.housekeeping().await;
            } else {
                self.assign(&ready_fds).await?;
            }
        }
        Ok(())
    }

    /// Idle tick: reap and backfill if a handshake failure, a failed
    /// respawn or a detached socket left the pool short.
    async fn housekeeping(&mut self) {
        if self.manager.attached_count() < self.manager.pool_size() {
            self.backfill().await;
        }
    }

    /// Reap and respawn. Failures leave the pool short until the next try.
    async fn backfill(&mut self) {
        if let Err(e) = self.manager.respawn_terminated_workers().await {
            tracing::warn!(
                error = %e,
                tracked = self.manager.len(),
                expected = self.manager.pool_size(),
                "Backfill failed, retrying on a later tick"
            );
        }
    }

    async fn handle_signals(&mut self) {
        let codes = match self.wakeup.drain() {
            Ok(codes) => codes,
            Err(e) => {
                tracing::warn!(error = %e, "Wakeup channel failed, stopping");
                self.running.store(false, Ordering::Release);
                return;
            }
        };

        let mut respawn = false;
        for code in codes {
            match code {
                SignalCode::ChildExit => respawn = true,
                SignalCode::ReopenLogs => match &self.reopen_logs {
                    Some(reopen) => {
                        tracing::info!("Reopening logs");
                        reopen();
                    }
                    None => tracing::debug!("No log reopen hook configured"),
                },
                code if code.is_shutdown() => {
                    tracing::info!(signal = ?code.signal(), "Shutdown signal received");
                    self.dispatcher.reset();
                    self.running.store(false, Ordering::Release);
                    return;
                }
                _ => {}
            }
        }

        if respawn {
            self.backfill().await;
        }
    }

    async fn assign(&mut self, ready_fds: &[RawFd]) -> Result<(), OrchestratorError> {
        let mut live = Vec::with_capacity(ready_fds.len());
        let mut dead = false;
        for &fd in ready_fds {
            let state = match self.manager.socket_for(fd) {
                Some(socket) => classify(socket),
                None => continue,
            };
            match state {
                SocketState::Live => live.push(fd),
                SocketState::Skip => {}
                SocketState::Dead => {
                    self.manager.detach(fd);
                    dead = true;
                }
            }
        }

        if dead {
            self.backfill().await;
        }
        if live.is_empty() {
            return Ok(());
        }

        let mut workers = self.manager.ready_workers(&live);
        match self
            .distributor
            .fetch_and_assign(&mut workers, self.supply.as_ref())
            .await
        {
            Ok(report) if !report.is_empty() => {
                tracing::debug!(
                    assigned = report.assigned.len(),
                    returned = report.returned.len(),
                    "Distribution cycle"
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(DistributorError::Supply(e)) if e.is_unrecoverable() => Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Distribution cycle failed");
                tokio::time::sleep(self.pool.empty_backoff).await;
                Ok(())
            }
        }
    }
}
