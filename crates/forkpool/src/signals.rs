//! Signal dispatch off the interrupt path.
//!
//! The OS-level callback only writes the signal number as one byte to a
//! socket-pair wakeup channel. A dedicated thread reads those bytes, pushes
//! them onto a pending stack and runs the registered handlers one at a time.
//!
//! Pending signals drain last-in-first-out, and the primary stack empties
//! before anything on the secondary stack (child-exit notifications) runs.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

/// Wakeup write ends the OS callback fans out to. One per live dispatcher.
const WAKEUP_SLOTS: usize = 4;
static WAKEUP_FDS: [AtomicI32; WAKEUP_SLOTS] = [const { AtomicI32::new(-1) }; WAKEUP_SLOTS];

/// Live registrations per signal number across dispatchers.
static TRAPPED: [AtomicUsize; 32] = [const { AtomicUsize::new(0) }; 32];

extern "C" fn on_signal(signum: libc::c_int) {
    let saved = nix::errno::Errno::last_raw();
    let byte = [signum as u8];
    for slot in &WAKEUP_FDS {
        let fd = slot.load(Ordering::Acquire);
        if fd >= 0 {
            // SAFETY: the slot only holds the write end of a live wakeup pair;
            // the owner clears the slot before closing it.
            let fd = unsafe { BorrowedFd::borrow_raw(fd) };
            // Full buffer: the reader is already awake, dropping the byte is fine.
            let _ = nix::unistd::write(fd, &byte);
        }
    }
    nix::errno::Errno::set_raw(saved);
}

/// Handler invoked on the dispatch thread.
pub type SignalHandler = Arc<dyn Fn(Signal) + Send + Sync>;

/// Which pending stack a signal lands on.
fn is_secondary(signal: Signal) -> bool {
    signal == Signal::SIGCHLD
}

#[derive(Default)]
struct Pending {
    primary: Vec<Signal>,
    secondary: Vec<Signal>,
}

struct Channel {
    writer: UnixStream,
    slot: usize,
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = WAKEUP_FDS[self.slot].compare_exchange(
            self.writer.as_raw_fd(),
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[derive(Default)]
struct Inner {
    handlers: Mutex<HashMap<Signal, SignalHandler>>,
    installed: Mutex<HashSet<Signal>>,
    pending: Mutex<Pending>,
    channel: Mutex<Option<Channel>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn enqueue(&self, signal: Signal) {
        let mut pending = lock(&self.pending);
        if is_secondary(signal) {
            pending.secondary.push(signal);
        } else {
            pending.primary.push(signal);
        }
    }

    fn next_pending(&self) -> Option<Signal> {
        let mut pending = lock(&self.pending);
        pending.primary.pop().or_else(|| pending.secondary.pop())
    }

    fn drain(&self) {
        while let Some(signal) = self.next_pending() {
            let handler = lock(&self.handlers).get(&signal).cloned();
            let Some(handler) = handler else {
                tracing::trace!(?signal, "No handler registered, ignoring");
                continue;
            };

            tracing::debug!(?signal, "Dispatching signal");
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(signal))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(?signal, error = %message, "Signal handler panicked");
            }
        }
    }

    fn restore_defaults(&self) {
        let installed: Vec<Signal> = lock(&self.installed).drain().collect();
        for signal in installed {
            let remaining = TRAPPED
                .get(signal as usize)
                .and_then(|count| {
                    count
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                        .ok()
                })
                .map_or(0, |previous| previous - 1);
            if remaining > 0 {
                continue;
            }
            let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            // SAFETY: restoring the default disposition installs no Rust code.
            if let Err(e) = unsafe { sigaction(signal, &default) } {
                tracing::warn!(?signal, error = %e, "Failed to restore default disposition");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.restore_defaults();
    }
}

/// Owned signal-handling context.
///
/// Cloning shares the same registration table. Create one per process and
/// call [`reset`](Self::reset) after crossing a spawn boundary.
#[derive(Clone, Default)]
pub struct SignalDispatcher {
    inner: Arc<Inner>,
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `signal`, replacing any previous one.
    ///
    /// Starts the dispatch thread on first use.
    pub fn trap<F>(&self, signal: Signal, handler: F) -> io::Result<()>
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.ensure_listening()?;

        let replaced = lock(&self.inner.handlers)
            .insert(signal, Arc::new(handler))
            .is_some();
        if replaced {
            tracing::warn!(?signal, "Replacing existing signal handler");
        }
        if !lock(&self.inner.installed).insert(signal) {
            return Ok(());
        }

        if let Some(count) = TRAPPED.get(signal as usize) {
            count.fetch_add(1, Ordering::AcqRel);
        }
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: `on_signal` only performs async-signal-safe writes and errno
        // save/restore.
        unsafe { sigaction(signal, &action) }.map_err(io::Error::from)?;
        tracing::debug!(?signal, "Trapped signal");
        Ok(())
    }

    /// Whether a handler is registered for `signal`.
    pub fn is_trapped(&self, signal: Signal) -> bool {
        lock(&self.inner.handlers).contains_key(&signal)
    }

    /// Restore default dispositions and forget all handlers and pending
    /// signals. The wakeup channel is closed, which ends the dispatch thread;
    /// a fresh channel is built by the next [`trap`](Self::trap).
    pub fn reset(&self) {
        lock(&self.inner.handlers).clear();
        self.inner.restore_defaults();

        let mut pending = lock(&self.inner.pending);
        pending.primary.clear();
        pending.secondary.clear();
        drop(pending);

        lock(&self.inner.channel).take();
        tracing::debug!("Signal dispatcher reset");
    }

    fn ensure_listening(&self) -> io::Result<()> {
        let mut channel = lock(&self.inner.channel);
        if channel.is_some() {
            return Ok(());
        }

        let (reader, writer) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;

        let fd = writer.as_raw_fd();
        let slot = WAKEUP_FDS
            .iter()
            .position(|s| s.compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Acquire).is_ok())
            .ok_or_else(|| io::Error::other("no free signal wakeup slot"))?;

        let weak = Arc::downgrade(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("forkpool-signals".to_string())
            .spawn(move || listen(weak, reader));
        let channel_value = Channel { writer, slot };
        spawned?;
        *channel = Some(channel_value);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn enqueue(&self, signal: Signal) {
        self.inner.enqueue(signal);
    }

    #[cfg(test)]
    pub(crate) fn drain(&self) {
        self.inner.drain();
    }
}

fn listen(inner: Weak<Inner>, mut reader: UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                tracing::trace!("Signal wakeup channel closed");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Signal wakeup channel failed");
                return;
            }
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        for &byte in &buf[..n] {
            match Signal::try_from(i32::from(byte)) {
                Ok(signal) => inner.enqueue(signal),
                Err(_) => tracing::warn!(byte, "Unknown signal number on wakeup channel"),
            }
        }
        inner.drain();
    }
}
