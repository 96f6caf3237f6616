//! Job handlers run inside worker processes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use forkpool::{JobError, JobHandler, UnitOfWork};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Logs each payload and succeeds.
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn perform(&self, unit: &UnitOfWork) -> Result<(), JobError> {
        tracing::info!(
            job_id = %unit.id,
            queue = %unit.queue,
            attempts = unit.attempts,
            payload = %unit.payload,
            "Processing unit"
        );
        Ok(())
    }
}

/// Runs a program per unit with the payload on stdin.
///
/// A non-zero exit fails the unit. The child is killed if the unit's
/// deadline cancels the wait.
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn perform(&self, unit: &UnitOfWork) -> Result<(), JobError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("FORKPOOL_JOB_ID", &unit.id)
            .env("FORKPOOL_QUEUE", &unit.queue)
            .env("FORKPOOL_ATTEMPTS", unit.attempts.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // The program may exit without reading; a closed pipe is not a failure.
            if let Err(e) = stdin.write_all(unit.payload.as_bytes()).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(e.into());
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(JobError::failed(format!("{} {}", self.program, status)))
        }
    }

    fn on_success(&self, unit: &UnitOfWork, elapsed: Duration) {
        tracing::debug!(
            job_id = %unit.id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Command succeeded",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(payload: &str) -> UnitOfWork {
        UnitOfWork::new("job-1", "jobs", payload).with_attempts(2)
    }

    fn sh(script: &str) -> CommandHandler {
        CommandHandler::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn payload_arrives_on_stdin() {
        let handler = sh(r#"test "$(cat)" = hello"#);
        handler.perform(&unit("hello")).await.unwrap();
        assert!(handler.perform(&unit("goodbye")).await.is_err());
    }

    #[tokio::test]
    async fn job_context_is_in_the_environment() {
        let handler =
            sh(r#"test "$FORKPOOL_JOB_ID/$FORKPOOL_QUEUE/$FORKPOOL_ATTEMPTS" = job-1/jobs/2"#);
        handler.perform(&unit("")).await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_unit() {
        let err = sh("exit 3").perform(&unit("x")).await.unwrap_err();
        assert!(matches!(err, JobError::Failed(_)));
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let handler = CommandHandler::new("/nonexistent/forkpool-handler", Vec::new());
        assert!(matches!(
            handler.perform(&unit("x")).await,
            Err(JobError::Io(_))
        ));
    }

    #[tokio::test]
    async fn log_handler_always_succeeds() {
        LogHandler.perform(&unit("anything")).await.unwrap();
    }
}
