//! Worker process side of the pool.
//!
//! Lifecycle: connect to the master's endpoint, report our pid, announce
//! readiness, then serve one dispatch at a time until shut down, orphaned,
//! disconnected or retired by the resource guard.
//!
//! The parent side (spawning, attachment, dispatch) lives in manager.rs and
//! distributor.rs.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, getppid};
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

use crate::bridge::protocol::{DispatchRequest, WorkerHello};
use crate::bridge::transport::{connect_to_master, read_message, send_message, signal_ready};
use crate::guard::{GuardLimits, ResourceGuard};
use crate::job::{ConsumerRegistry, JobError, UnitOfWork};
use crate::signals::SignalDispatcher;

/// Environment variable carrying [`WorkerSettings`] as JSON.
pub const WORKER_SETTINGS_ENV: &str = "FORKPOOL_WORKER_SETTINGS";

/// How long one readiness wait lasts before the running flag is rechecked.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Executes units of work inside a worker process.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn perform(&self, unit: &UnitOfWork) -> Result<(), JobError>;

    fn on_success(&self, _unit: &UnitOfWork, _elapsed: Duration) {}

    fn on_failure(&self, _unit: &UnitOfWork, _error: &JobError) {}
}

/// Everything a worker needs from its master, passed across the spawn boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub endpoint: PathBuf,
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub limits: GuardLimits,
}

impl WorkerSettings {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
            limits: GuardLimits::default(),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_limits(mut self, limits: GuardLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms.max(1))
    }

    pub fn to_env_value(&self) -> io::Result<String> {
        serde_json::to_string(self).map_err(io::Error::other)
    }

    /// Read settings from [`WORKER_SETTINGS_ENV`].
    pub fn from_env() -> io::Result<Self> {
        let raw = std::env::var(WORKER_SETTINGS_ENV).map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not set", WORKER_SETTINGS_ENV),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

/// Why the serve loop ended. Every variant maps to exit status 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The running flag was cleared by a termination signal.
    Shutdown,
    /// The parent process changed; the master is gone.
    Orphaned,
    /// The master closed or reset the connection.
    Disconnected,
    /// A unit overran its deadline; the worker is abandoned.
    DeadlineExceeded,
    /// The resource guard retired this worker.
    ResourceLimit,
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// The serve loop, separated from process setup so it can run against any
/// connected socket.
pub struct WorkerLoop<H> {
    handler: Arc<H>,
    registry: ConsumerRegistry,
    guard: ResourceGuard,
    running: Arc<AtomicBool>,
    shutdown_timeout: Duration,
    parent: Pid,
}

impl<H: JobHandler> WorkerLoop<H> {
    pub fn new(handler: Arc<H>, registry: ConsumerRegistry, guard: ResourceGuard) -> Self {
        Self {
            handler,
            registry,
            guard,
            running: Arc::new(AtomicBool::new(true)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            parent: getppid(),
        }
    }

    pub fn with_running_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Override the parent pid used for orphan detection.
    pub fn with_parent(mut self, parent: Pid) -> Self {
        self.parent = parent;
        self
    }

    /// Report our pid, announce readiness and serve until the loop ends.
    pub async fn start(mut self, mut conn: UnixStream) -> io::Result<WorkerExit> {
        let pid = std::process::id();
        send_message(&mut conn, WorkerHello { pid }).await?;
        signal_ready(&mut conn).await?;
        tracing::info!(pid, "Worker attached to master");
        self.serve(&mut conn).await
    }

    async fn serve(&mut self, conn: &mut UnixStream) -> io::Result<WorkerExit> {
        loop {
            if !self.running.load(Ordering::Acquire) {
                tracing::info!("Worker stopping");
                return Ok(WorkerExit::Shutdown);
            }

            let woke = match tokio::time::timeout(self.shutdown_timeout, conn.readable()).await {
                Err(_) => false,
                Ok(Err(e)) if is_disconnect(&e) => return Ok(disconnected(&e)),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => true,
            };

            let request = if woke {
                match read_message::<DispatchRequest>(conn).await {
                    Ok(request) => request,
                    Err(e) if is_disconnect(&e) => return Ok(disconnected(&e)),
                    Err(e) => return Err(e),
                }
            } else {
                None
            };
            let Some(request) = request else {
                if self.is_orphaned() {
                    return Ok(WorkerExit::Orphaned);
                }
                continue;
            };

            let mut units = request.into_units().into_iter();
            while let Some(unit) = units.next() {
                if let Some(exit) = self.execute(unit).await {
                    for skipped in units {
                        tracing::warn!(job_id = %skipped.id, "Rejecting unit left unexecuted");
                        self.acknowledge(&skipped, false).await;
                    }
                    return Ok(exit);
                }
            }

            if self.guard.check_memory() || self.guard.check_requests() {
                return Ok(WorkerExit::ResourceLimit);
            }

            match signal_ready(conn).await {
                Ok(()) => {}
                Err(e) if is_disconnect(&e) => return Ok(disconnected(&e)),
                Err(e) => return Err(e),
            }
        }
    }

    fn is_orphaned(&self) -> bool {
        let orphaned = getppid() != self.parent;
        if orphaned {
            tracing::info!(parent = %self.parent, "Parent process changed, worker orphaned");
        }
        orphaned
    }

    /// Run one unit under its deadline. Returns an exit reason when the
    /// worker must not continue.
    async fn execute(&self, unit: UnitOfWork) -> Option<WorkerExit> {
        tracing::debug!(
            job_id = %unit.id,
            queue = %unit.queue,
            attempts = unit.attempts,
            "Executing unit",
        );
        let started = Instant::now();
        let work = std::panic::AssertUnwindSafe(self.handler.perform(&unit)).catch_unwind();

        let outcome = match unit.timeout() {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let error = JobError::DeadlineExceeded(limit);
                    tracing::error!(
                        job_id = %unit.id,
                        queue = %unit.queue,
                        error = %error,
                        "Unit overran its deadline, worker exiting",
                    );
                    self.handler.on_failure(&unit, &error);
                    self.acknowledge(&unit, false).await;
                    return Some(WorkerExit::DeadlineExceeded);
                }
            },
            None => work.await,
        };

        let result = outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(JobError::Panicked(message))
        });

        match result {
            Ok(()) => {
                let elapsed = started.elapsed();
                tracing::info!(
                    job_id = %unit.id,
                    queue = %unit.queue,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Unit completed",
                );
                self.handler.on_success(&unit, elapsed);
                self.acknowledge(&unit, true).await;
            }
            Err(error) => {
                tracing::warn!(
                    job_id = %unit.id,
                    queue = %unit.queue,
                    error = %error,
                    "Unit failed",
                );
                self.handler.on_failure(&unit, &error);
                self.acknowledge(&unit, false).await;
            }
        }
        None
    }

    async fn acknowledge(&self, unit: &UnitOfWork, success: bool) {
        let Some(consumer) = self.registry.get(&unit.queue) else {
            let error = JobError::UnknownQueue(unit.queue.clone());
            tracing::error!(job_id = %unit.id, error = %error, "Cannot acknowledge unit");
            return;
        };

        let result = if success {
            consumer.complete(unit).await
        } else {
            consumer.reject(unit).await
        };
        if let Err(e) = result {
            tracing::error!(
                job_id = %unit.id,
                queue = %unit.queue,
                success,
                error = %e,
                "Acknowledgement failed",
            );
        }
    }
}

fn disconnected(e: &io::Error) -> WorkerExit {
    tracing::info!(error = %e, "Master connection closed");
    WorkerExit::Disconnected
}

/// Worker process entry: reset inherited state, trap termination signals,
/// connect and serve.
///
/// The caller is expected to exit with status 0 whatever this returns.
pub async fn run_worker<H: JobHandler>(
    handler: Arc<H>,
    registry: ConsumerRegistry,
    settings: WorkerSettings,
) -> io::Result<WorkerExit> {
    let dispatcher = SignalDispatcher::new();
    dispatcher.reset();
    registry.reset_connections();

    let running = Arc::new(AtomicBool::new(true));
    for signal in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        let running = Arc::clone(&running);
        dispatcher.trap(signal, move |signal| {
            tracing::info!(?signal, "Worker received termination signal");
            running.store(false, Ordering::Release);
        })?;
    }

    let conn = connect_to_master(&settings.endpoint).await?;
    tracing::trace!(endpoint = %settings.endpoint.display(), "Connected to master");

    let exit = WorkerLoop::new(handler, registry.clone(), ResourceGuard::new(settings.limits))
        .with_running_flag(running)
        .with_shutdown_timeout(settings.shutdown_timeout())
        .start(conn)
        .await;

    registry.stop_all();
    dispatcher.reset();
    tracing::info!(?exit, "Worker exiting");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::{clear_ready, recv_message};
    use crate::job::Consumer;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct RecordingConsumer {
        completed: Mutex<Vec<String>>,
        rejected: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Consumer for RecordingConsumer {
        async fn complete(&self, unit: &UnitOfWork) -> Result<(), JobError> {
            self.completed.lock().unwrap().push(unit.id.clone());
            Ok(())
        }

        async fn reject(&self, unit: &UnitOfWork) -> Result<(), JobError> {
            self.rejected.lock().unwrap().push(unit.id.clone());
            Ok(())
        }
    }

    /// Payload decides the outcome: "ok", "fail", "panic" or "sleep".
    #[derive(Default)]
    struct ScriptedHandler {
        successes: AtomicU32,
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn perform(&self, unit: &UnitOfWork) -> Result<(), JobError> {
            match unit.payload.as_str() {
                "fail" => Err(JobError::failed("scripted failure")),
                "panic" => panic!("scripted panic"),
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn on_success(&self, _unit: &UnitOfWork, _elapsed: Duration) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _unit: &UnitOfWork, _error: &JobError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        master: UnixStream,
        consumer: Arc<RecordingConsumer>,
        handler: Arc<ScriptedHandler>,
        worker: tokio::task::JoinHandle<io::Result<WorkerExit>>,
    }

    fn quiet_guard(limits: GuardLimits) -> ResourceGuard {
        ResourceGuard::new(limits).with_exit(|_| {})
    }

    async fn start(guard: ResourceGuard) -> Harness {
        let (master, worker_end) = UnixStream::pair().unwrap();
        let consumer = Arc::new(RecordingConsumer::default());
        let handler = Arc::new(ScriptedHandler::default());
        let registry = ConsumerRegistry::new().with_consumer("default", consumer.clone());
        let worker = tokio::spawn(
            WorkerLoop::new(handler.clone(), registry, guard)
                .with_shutdown_timeout(Duration::from_millis(50))
                .start(worker_end),
        );
        let mut harness = Harness {
            master,
            consumer,
            handler,
            worker,
        };

        let hello: WorkerHello = recv_message(&mut harness.master).await.unwrap();
        assert_eq!(hello.pid, std::process::id());
        harness.await_ready().await;
        harness
    }

    impl Harness {
        async fn await_ready(&mut self) {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    self.master.readable().await.unwrap();
                    if clear_ready(&mut self.master).await.unwrap() {
                        return;
                    }
                }
            })
            .await
            .expect("worker never signalled readiness");
        }

        async fn dispatch(&mut self, id: &str, payload: &str) {
            let unit = UnitOfWork::new(id, "default", payload);
            send_message(&mut self.master, DispatchRequest::perform(vec![unit]))
                .await
                .unwrap();
        }

        async fn finish(self) -> WorkerExit {
            drop(self.master);
            tokio::time::timeout(Duration::from_secs(5), self.worker)
                .await
                .unwrap()
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn outcomes_are_acknowledged_and_readiness_follows_each_unit() {
        let mut h = start(quiet_guard(GuardLimits::default())).await;

        h.dispatch("a", "ok").await;
        h.await_ready().await;
        h.dispatch("b", "fail").await;
        h.await_ready().await;
        h.dispatch("c", "panic").await;
        h.await_ready().await;

        assert_eq!(*h.consumer.completed.lock().unwrap(), vec!["a"]);
        assert_eq!(*h.consumer.rejected.lock().unwrap(), vec!["b", "c"]);
        assert_eq!(h.handler.successes.load(Ordering::SeqCst), 1);
        assert_eq!(h.handler.failures.load(Ordering::SeqCst), 2);

        let consumer = h.consumer.clone();
        assert_eq!(h.finish().await, WorkerExit::Disconnected);
        assert_eq!(consumer.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deadline_overrun_rejects_and_exits() {
        let mut h = start(quiet_guard(GuardLimits::default())).await;

        let unit =
            UnitOfWork::new("slow", "default", "sleep").with_timeout(Duration::from_millis(50));
        send_message(&mut h.master, DispatchRequest::perform(vec![unit]))
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), &mut h.worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::DeadlineExceeded);
        assert_eq!(*h.consumer.rejected.lock().unwrap(), vec!["slow"]);
    }

    #[tokio::test]
    async fn request_ceiling_retires_worker_without_new_readiness() {
        let limits = GuardLimits {
            max_requests: 2,
            ..GuardLimits::default()
        };
        let mut h = start(quiet_guard(limits)).await;

        h.dispatch("first", "ok").await;
        h.await_ready().await;
        h.dispatch("second", "ok").await;

        let exit = tokio::time::timeout(Duration::from_secs(5), &mut h.worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::ResourceLimit);
        assert!(!clear_ready(&mut h.master).await.unwrap_or(false));
        assert_eq!(h.consumer.completed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cleared_running_flag_stops_at_top_of_loop() {
        let (mut master, worker_end) = UnixStream::pair().unwrap();
        let running = Arc::new(AtomicBool::new(false));
        let worker = WorkerLoop::new(
            Arc::new(ScriptedHandler::default()),
            ConsumerRegistry::new(),
            quiet_guard(GuardLimits::default()),
        )
        .with_running_flag(running);

        let exit = worker.start(worker_end).await.unwrap();
        assert_eq!(exit, WorkerExit::Shutdown);
        let hello: WorkerHello = recv_message(&mut master).await.unwrap();
        assert_eq!(hello.pid, std::process::id());
    }

    #[tokio::test]
    async fn empty_read_after_parent_change_exits_as_orphan() {
        use tokio::io::AsyncWriteExt;

        let (mut master, worker_end) = UnixStream::pair().unwrap();
        let worker = tokio::spawn(
            WorkerLoop::new(
                Arc::new(ScriptedHandler::default()),
                ConsumerRegistry::new(),
                quiet_guard(GuardLimits::default()),
            )
            .with_parent(Pid::from_raw(i32::MAX))
            .with_shutdown_timeout(Duration::from_millis(50))
            .start(worker_end),
        );

        let _: WorkerHello = recv_message(&mut master).await.unwrap();
        // Half a length prefix: readable, but no message yet.
        master.write_all(&[0, 0]).await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Orphaned);
    }

    #[test]
    fn settings_survive_the_environment() {
        let settings = WorkerSettings::new("/tmp/forkpool-1.sock")
            .with_shutdown_timeout(Duration::from_millis(250))
            .with_limits(GuardLimits {
                max_memory: 1 << 20,
                memory_check_cycle: 4,
                max_requests: 10,
            });
        let raw = settings.to_env_value().unwrap();
        let parsed: WorkerSettings = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, settings);
        assert_eq!(parsed.shutdown_timeout(), Duration::from_millis(250));
    }
}
