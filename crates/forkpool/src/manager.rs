//! Master-side worker lifecycle: spawn, attach, reap, stop.
//!
//! Two maps track the pool: pid → handle, and socket fd → pid. Both are
//! owned by whoever owns the manager (the assignment loop), so nothing else
//! mutates them.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::net::UnixStream;

use crate::bridge::protocol::WorkerHello;
use crate::bridge::transport::{Endpoint, accept_connection, recv_message};
use crate::termination::{TerminationReason, analyze_wait_status};
use crate::worker::{WORKER_SETTINGS_ENV, WorkerSettings};

/// Flag that switches the re-executed binary into worker mode.
pub const INTERNAL_WORKER_FLAG: &str = "--internal-worker";

/// Default bound on accept + hello for freshly spawned workers.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("pool has {tracked} workers after spawning, expected {expected}")]
    PoolSize { tracked: usize, expected: usize },
}

/// The "spawn worker" capability.
///
/// The returned process must connect to `settings.endpoint`, send a
/// [`WorkerHello`] and then follow the worker protocol.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, settings: &WorkerSettings) -> Result<Child, SpawnError>;
}

/// Re-executes a program in worker mode, passing settings through the
/// environment.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ExecSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Spawner for the running binary.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments appended after the worker flag.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&self, settings: &WorkerSettings) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .arg(INTERNAL_WORKER_FLAG)
            .args(&self.args)
            .env(WORKER_SETTINGS_ENV, settings.to_env_value()?)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(child)
    }
}

/// One tracked worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: u32,
    socket: Option<UnixStream>,
    spawned_at: Instant,
}

impl WorkerHandle {
    fn spawned(pid: u32) -> Self {
        Self {
            pid,
            socket: None,
            spawned_at: Instant::now(),
        }
    }

    /// Handle for an already-connected worker.
    pub fn attached(pid: u32, socket: UnixStream) -> Self {
        Self {
            pid,
            socket: Some(socket),
            spawned_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn socket(&self) -> Option<&UnixStream> {
        self.socket.as_ref()
    }

    pub fn socket_mut(&mut self) -> Option<&mut UnixStream> {
        self.socket.as_mut()
    }

    pub fn is_attached(&self) -> bool {
        self.socket.is_some()
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }
}

pub struct WorkerManager {
    pool_size: usize,
    endpoint: Endpoint,
    spawner: Arc<dyn WorkerSpawner>,
    settings: WorkerSettings,
    handshake_timeout: Duration,
    handles: HashMap<u32, WorkerHandle>,
    pid_by_fd: HashMap<RawFd, u32>,
}

impl WorkerManager {
    /// `settings` is the template handed to every spawned worker; its
    /// endpoint is replaced with this manager's endpoint path.
    pub fn new(
        endpoint: Endpoint,
        spawner: Arc<dyn WorkerSpawner>,
        settings: WorkerSettings,
        pool_size: usize,
    ) -> Self {
        let settings = WorkerSettings {
            endpoint: endpoint.path().to_path_buf(),
            ..settings
        };
        Self {
            pool_size,
            endpoint,
            spawner,
            settings,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handles: HashMap::new(),
            pid_by_fd: HashMap::new(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of tracked pids.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.handles.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.handles.contains_key(&pid)
    }

    pub fn attached_count(&self) -> usize {
        self.pid_by_fd.len()
    }

    /// Attached sockets with their fds, for readiness multiplexing.
    pub fn sockets(&self) -> Vec<(RawFd, &UnixStream)> {
        self.handles
            .values()
            .filter_map(|h| h.socket.as_ref().map(|s| (s.as_raw_fd(), s)))
            .collect()
    }

    pub fn socket_for(&self, fd: RawFd) -> Option<&UnixStream> {
        let pid = self.pid_by_fd.get(&fd)?;
        self.handles.get(pid)?.socket.as_ref()
    }

    /// Map ready socket fds back to their worker handles.
    pub fn ready_workers(&mut self, fds: &[RawFd]) -> Vec<&mut WorkerHandle> {
        let wanted: HashSet<u32> = fds
            .iter()
            .filter_map(|fd| self.pid_by_fd.get(fd).copied())
            .collect();
        self.handles
            .values_mut()
            .filter(|h| wanted.contains(&h.pid))
            .collect()
    }

    /// Drop the socket of a worker whose peer end closed. The pid stays
    /// tracked until it is reaped.
    pub fn detach(&mut self, fd: RawFd) -> Option<u32> {
        let pid = self.pid_by_fd.remove(&fd)?;
        if let Some(handle) = self.handles.get_mut(&pid) {
            handle.socket = None;
        }
        tracing::debug!(pid, fd, "Detached worker socket");
        Some(pid)
    }

    /// Spawn the deficit up to the pool size and attach each new worker's
    /// connection by the pid it reports.
    ///
    /// Workers that do not finish the handshake in time are killed and
    /// forgotten; the next call backfills them. Returns the attached pids.
    pub async fn create_and_attach_workers(&mut self) -> Result<Vec<u32>, ManagerError> {
        let deficit = self.pool_size.saturating_sub(self.handles.len());
        if deficit == 0 {
            return Ok(Vec::new());
        }

        let mut spawned = Vec::with_capacity(deficit);
        let mut spawn_error = None;
        for _ in 0..deficit {
            match self.spawner.spawn(&self.settings) {
                Ok(child) => {
                    let pid = child.id();
                    tracing::info!(pid, "Spawned worker");
                    self.handles.insert(pid, WorkerHandle::spawned(pid));
                    spawned.push(pid);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to spawn worker");
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let tracked = self.handles.len();
        let attached = self.attach(spawned).await;

        if let Some(e) = spawn_error {
            return Err(e.into());
        }
        if tracked != self.pool_size {
            return Err(ManagerError::PoolSize {
                tracked,
                expected: self.pool_size,
            });
        }
        Ok(attached)
    }

    async fn attach(&mut self, spawned: Vec<u32>) -> Vec<u32> {
        let mut pending: HashSet<u32> = spawned.into_iter().collect();
        let mut attached = Vec::with_capacity(pending.len());
        let deadline = tokio::time::Instant::now() + self.handshake_timeout;

        while !pending.is_empty() {
            let accepted =
                tokio::time::timeout_at(deadline, accept_connection(&self.endpoint)).await;
            let mut stream = match accepted {
                Err(_) => break,
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to accept worker connection");
                    continue;
                }
            };

            let hello =
                tokio::time::timeout_at(deadline, recv_message::<WorkerHello>(&mut stream)).await;
            let pid = match hello {
                Err(_) => break,
                Ok(Ok(hello)) => hello.pid,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Worker connection closed before handshake");
                    continue;
                }
            };

            if !pending.remove(&pid) {
                tracing::warn!(pid, "Handshake from untracked pid, dropping connection");
                continue;
            }
            let fd = stream.as_raw_fd();
            if let Some(handle) = self.handles.get_mut(&pid) {
                handle.socket = Some(stream);
                self.pid_by_fd.insert(fd, pid);
                tracing::debug!(pid, fd, "Attached worker");
                attached.push(pid);
            }
        }

        for pid in pending {
            tracing::warn!(
                pid,
                timeout = ?self.handshake_timeout,
                "Worker did not complete handshake, killing",
            );
            self.kill_and_forget(pid);
        }
        attached
    }

    /// Reap exited workers and backfill the pool. Returns the reaped pids.
    pub async fn respawn_terminated_workers(&mut self) -> Result<Vec<u32>, ManagerError> {
        let reaped = self.reap();
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "Respawning terminated workers");
        }
        self.create_and_attach_workers().await?;
        Ok(reaped)
    }

    /// Non-blocking wait on each tracked pid. Only our own pids are probed.
    pub fn reap(&mut self) -> Vec<u32> {
        let mut reaped = Vec::new();
        let pids: Vec<u32> = self.handles.keys().copied().collect();
        for pid in pids {
            let reason = match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => analyze_wait_status(status),
                Err(Errno::ECHILD) => TerminationReason::Unknown,
                Err(e) => {
                    tracing::warn!(pid, error = %e, "waitpid failed");
                    continue;
                }
            };
            if !reason.has_exited() {
                continue;
            }

            if reason.is_planned() {
                tracing::info!(pid, %reason, "Worker exited");
            } else {
                tracing::warn!(pid, %reason, "Worker terminated unexpectedly");
            }
            self.forget(pid);
            reaped.push(pid);
        }
        reaped
    }

    /// Send `signal` to every worker, wait up to `grace` for them to exit,
    /// then SIGKILL and reap whatever is left.
    pub async fn stop_workers(&mut self, signal: Signal, grace: Duration) {
        if self.handles.is_empty() {
            return;
        }
        tracing::info!(?signal, workers = self.handles.len(), "Stopping workers");

        for pid in self.handles.keys() {
            if let Err(e) = kill(Pid::from_raw(*pid as i32), signal) {
                tracing::debug!(pid, error = %e, "Failed to signal worker");
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.handles.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(REAP_POLL_INTERVAL).await;
        }

        let stragglers: Vec<u32> = self.handles.keys().copied().collect();
        for pid in stragglers {
            tracing::warn!(pid, ?grace, "Worker ignored stop signal, killing");
            self.kill_and_forget(pid);
        }
    }

    fn kill_and_forget(&mut self, pid: u32) {
        let target = Pid::from_raw(pid as i32);
        match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid, error = %e, "Failed to kill worker"),
        }
        match waitpid(target, None) {
            Ok(status) => tracing::debug!(
                pid,
                reason = %analyze_wait_status(status),
                "Reaped killed worker",
            ),
            Err(e) => tracing::debug!(pid, error = %e, "Killed worker already reaped"),
        }
        self.forget(pid);
    }

    fn forget(&mut self, pid: u32) {
        let socket = self.handles.remove(&pid).and_then(|h| h.socket);
        if let Some(socket) = socket {
            self.pid_by_fd.remove(&socket.as_raw_fd());
        }
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("pool_size", &self.pool_size)
            .field("endpoint", &self.endpoint.path())
            .field("pids", &self.pids())
            .field("attached", &self.attached_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spawns processes that never connect.
    struct SleepSpawner;

    impl WorkerSpawner for SleepSpawner {
        fn spawn(&self, _settings: &WorkerSettings) -> Result<Child, SpawnError> {
            Ok(Command::new("sleep").arg("30").spawn()?)
        }
    }

    struct BrokenSpawner;

    impl WorkerSpawner for BrokenSpawner {
        fn spawn(&self, _settings: &WorkerSettings) -> Result<Child, SpawnError> {
            Err(SpawnError::Other("no more processes".into()))
        }
    }

    fn manager(
        dir: &std::path::Path,
        spawner: Arc<dyn WorkerSpawner>,
        size: usize,
    ) -> WorkerManager {
        let endpoint = Endpoint::bind(dir.join("manager.sock")).unwrap();
        WorkerManager::new(endpoint, spawner, WorkerSettings::new("/unused"), size)
            .with_handshake_timeout(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn handshake_timeout_kills_and_untracks_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path(), Arc::new(SleepSpawner), 2);

        let attached = manager.create_and_attach_workers().await.unwrap();
        assert!(attached.is_empty());
        assert!(manager.is_empty());
        assert_eq!(manager.attached_count(), 0);
    }

    #[tokio::test]
    async fn killed_sleepers_are_gone_from_the_process_table() {
        struct Recording(std::sync::Mutex<Vec<u32>>);
        impl WorkerSpawner for Recording {
            fn spawn(&self, settings: &WorkerSettings) -> Result<Child, SpawnError> {
                let child = SleepSpawner.spawn(settings)?;
                self.0.lock().unwrap().push(child.id());
                Ok(child)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(Recording(std::sync::Mutex::new(Vec::new())));
        let mut manager = manager(dir.path(), spawner.clone(), 1);
        manager.create_and_attach_workers().await.unwrap();

        let pids = spawner.0.lock().unwrap().clone();
        assert_eq!(pids.len(), 1);
        assert_eq!(
            kill(Pid::from_raw(pids[0] as i32), None),
            Err(Errno::ESRCH)
        );
        assert!(!manager.is_tracked(pids[0]));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path(), Arc::new(BrokenSpawner), 2);

        let err = manager.create_and_attach_workers().await.unwrap_err();
        assert!(matches!(err, ManagerError::Spawn(SpawnError::Other(_))));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn full_pool_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path(), Arc::new(BrokenSpawner), 0);
        assert!(manager.create_and_attach_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_point_at_the_manager_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(BrokenSpawner), 1);
        assert_eq!(manager.settings.endpoint, dir.path().join("manager.sock"));
    }
}
