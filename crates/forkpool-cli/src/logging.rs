//! Tracing setup for both the master and worker processes.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;

/// Log file that can be reopened in place, e.g. after rotation.
#[derive(Clone)]
pub struct ReopenableFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ReopenableFile {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swap in a fresh handle for the same path.
    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct ReopenableWriter {
    file: Arc<Mutex<File>>,
}

impl Write for ReopenableWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenableFile {
    type Writer = ReopenableWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ReopenableWriter {
            file: Arc::clone(&self.file),
        }
    }
}

fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match std::env::var("FORKPOOL_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("forkpool={level},forkpool_cli={level}", level = level))
}

/// Install the global subscriber.
///
/// Output goes to stderr unless `FORKPOOL_LOG_FILE` names a file; in that
/// case the returned handle reopens it on demand.
pub fn init_tracing() -> Option<ReopenableFile> {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    let log_file = std::env::var_os("FORKPOOL_LOG_FILE").and_then(|path| {
        match ReopenableFile::open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("warning: cannot open log file {:?}: {}", path, e);
                None
            }
        }
    });

    let registry = tracing_subscriber::registry().with(filter());
    let _ = match (&log_file, use_json) {
        (Some(file), true) => registry
            .with(fmt::layer().json().with_writer(file.clone()))
            .try_init(),
        (Some(file), false) => registry
            .with(fmt::layer().with_ansi(false).with_writer(file.clone()))
            .try_init(),
        (None, true) => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init(),
        (None, false) => registry
            .with(fmt::layer().with_writer(io::stderr))
            .try_init(),
    };
    log_file
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_follows_a_rotated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forkpool.log");
        let log = ReopenableFile::open(&path).unwrap();

        log.make_writer().write_all(b"before\n").unwrap();
        let rotated = dir.path().join("forkpool.log.1");
        std::fs::rename(&path, &rotated).unwrap();

        log.make_writer().write_all(b"still old\n").unwrap();
        log.reopen().unwrap();
        log.make_writer().write_all(b"after\n").unwrap();

        assert_eq!(
            std::fs::read_to_string(&rotated).unwrap(),
            "before\nstill old\n"
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after\n");
    }
}
