//! Unix socket transport for master/worker IPC.
//!
//! Socket path format: `{temp_dir}/forkpool-{master_pid}.sock`
//!
//! Reads never consume past the end of a frame: the length prefix is peeked
//! first and exactly `prefix + length` bytes are then read. Readiness tokens
//! share the worker→master direction with the handshake frame, so a buffered
//! reader here would silently eat tokens.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::task::Poll;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::codec::{JsonCodec, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};

/// Token a worker writes when it can accept one more dispatch.
pub const READY_TOKEN: &[u8] = b"ready\n";

/// Default bound for [`select_ready`].
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Listening endpoint path for a master process.
pub fn endpoint_path(master_pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("forkpool-{}.sock", master_pid))
}

/// Listening socket owned by the master.
///
/// The socket file is removed on drop, but only by the process that bound it.
pub struct Endpoint {
    path: PathBuf,
    listener: UnixListener,
    owner_pid: u32,
}

impl Endpoint {
    /// Bind at `path`, removing any stale socket file first.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let path = path.into();
        if path.exists() {
            tracing::debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(&path)?;
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;
        tracing::debug!(path = %path.display(), "Bound worker endpoint");

        Ok(Self {
            path,
            listener,
            owner_pid: std::process::id(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cleanup(&self) -> io::Result<()> {
        if self.owner_pid == std::process::id() && self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Removing worker endpoint");
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to remove worker endpoint");
        }
    }
}

/// Bind the endpoint for the current (master) process.
pub fn create_listening_socket() -> io::Result<Endpoint> {
    Endpoint::bind(endpoint_path(std::process::id()))
}

/// Wait for one worker to connect.
pub async fn accept_connection(endpoint: &Endpoint) -> io::Result<UnixStream> {
    let (stream, _) = endpoint.listener.accept().await?;
    Ok(stream)
}

/// Connect from the worker side.
pub async fn connect_to_master(path: &Path) -> io::Result<UnixStream> {
    tracing::trace!(path = %path.display(), "Connecting to master");
    UnixStream::connect(path).await
}

/// Serialize `value` and write it as one frame.
///
/// A vanished peer surfaces as `BrokenPipe` (or `ConnectionReset`).
pub async fn send_message<T: Serialize>(conn: &mut UnixStream, value: T) -> io::Result<()> {
    let mut codec = JsonCodec::<T>::new();
    let mut buf = BytesMut::new();
    codec.encode(value, &mut buf)?;
    conn.write_all(&buf).await?;
    conn.flush().await
}

/// What a non-destructive look at a socket found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// At least one byte is waiting.
    Pending,
    /// Nothing to read right now.
    Idle,
    /// The peer closed its end.
    Closed,
}

/// Peek without consuming. `WouldBlock` means nothing is buffered.
fn peek(conn: &UnixStream, buf: &mut [u8]) -> io::Result<usize> {
    peek_with(conn, buf, 1)
}

/// Peek that wants `buf.len()` bytes. A partial buffer is reported as
/// `WouldBlock` so tokio drops the cached readiness and the next wait
/// blocks until more bytes arrive.
fn peek_full(conn: &UnixStream, buf: &mut [u8]) -> io::Result<usize> {
    let want = buf.len();
    peek_with(conn, buf, want)
}

fn peek_with(conn: &UnixStream, buf: &mut [u8], want: usize) -> io::Result<usize> {
    let fd = conn.as_raw_fd();
    conn.try_io(Interest::READABLE, || {
        // SAFETY: `fd` belongs to `conn`, which outlives this call, and `buf`
        // is a valid writable region of `buf.len()` bytes.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_PEEK) };
        match n {
            n if n < 0 => Err(io::Error::last_os_error()),
            0 => Ok(0),
            n if (n as usize) < want => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n as usize),
        }
    })
}

/// Look at a socket without consuming anything.
pub fn probe(conn: &UnixStream) -> io::Result<Probe> {
    let mut byte = [0u8; 1];
    match peek(conn, &mut byte) {
        Ok(0) => Ok(Probe::Closed),
        Ok(_) => Ok(Probe::Pending),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Probe::Idle),
        Err(e) => Err(e),
    }
}

/// Read one frame if its length prefix is already available.
///
/// Returns `Ok(None)` when no complete prefix is buffered yet; a partial
/// prefix also clears the socket's readiness. Once the prefix has been
/// observed, the full frame is read before returning. A closed peer is
/// reported as `UnexpectedEof`; resets propagate unchanged.
pub async fn read_message<T: DeserializeOwned>(conn: &mut UnixStream) -> io::Result<Option<T>> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match peek_full(conn, &mut prefix) {
        Ok(0) => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            ));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut frame = BytesMut::zeroed(LENGTH_PREFIX_LEN + len);
    conn.read_exact(&mut frame).await?;

    let mut codec = JsonCodec::<T>::new();
    match codec.decode(&mut frame)? {
        Some(value) => Ok(Some(value)),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "incomplete frame after exact read",
        )),
    }
}

/// Wait (unbounded) for the next frame. Callers wrap this in a timeout.
pub async fn recv_message<T: DeserializeOwned>(conn: &mut UnixStream) -> io::Result<T> {
    loop {
        conn.readable().await?;
        if let Some(value) = read_message(conn).await? {
            return Ok(value);
        }
    }
}

/// Worker side: announce capacity for exactly one more dispatch.
pub async fn signal_ready(conn: &mut UnixStream) -> io::Result<()> {
    conn.write_all(READY_TOKEN).await?;
    conn.flush().await
}

/// Master side: consume exactly one readiness token.
///
/// Returns `Ok(false)` when no token is buffered. Extra tokens are left in
/// place for later calls.
pub async fn clear_ready(conn: &mut UnixStream) -> io::Result<bool> {
    let mut token = [0u8; READY_TOKEN.len()];
    match peek_full(conn, &mut token) {
        Ok(0) => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            ));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
        Err(e) => return Err(e),
    }

    conn.read_exact(&mut token).await?;
    if token != READY_TOKEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected readiness token, got {:?}", String::from_utf8_lossy(&token)),
        ));
    }
    Ok(true)
}

/// Result of a [`select_ready`] call that did not time out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Indexes into the `sockets` slice that are readable.
    pub readable: Vec<usize>,
    /// The wakeup channel has bytes pending.
    pub wakeup: bool,
}

/// Readiness multiplexing over `sockets` plus an optional wakeup channel.
///
/// Returns `Ok(None)` if nothing became readable within `timeout`. A socket
/// whose readiness poll errors is reported readable so the caller sees the
/// error on its next read.
pub async fn select_ready(
    sockets: &[&UnixStream],
    wakeup: Option<&UnixStream>,
    timeout: Duration,
) -> io::Result<Option<Readiness>> {
    let ready = std::future::poll_fn(|cx| {
        let mut readable = Vec::new();
        for (idx, socket) in sockets.iter().enumerate() {
            if let Poll::Ready(_) = socket.poll_read_ready(cx) {
                readable.push(idx);
            }
        }

        let wakeup = match wakeup.map(|w| w.poll_read_ready(cx)) {
            Some(Poll::Ready(Err(e))) => return Poll::Ready(Err(e)),
            Some(Poll::Ready(Ok(()))) => true,
            _ => false,
        };

        if readable.is_empty() && !wakeup {
            Poll::Pending
        } else {
            Poll::Ready(Ok(Readiness { readable, wakeup }))
        }
    });

    match tokio::time::timeout(timeout, ready).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

/// Whether a write to `conn` would not block and the peer has not hung up.
pub fn is_writable(conn: &UnixStream) -> bool {
    poll_writable(conn.as_raw_fd())
}

fn poll_writable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: `pfd` is a single valid pollfd and the timeout is zero.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    rc == 1
        && pfd.revents & libc::POLLOUT != 0
        && pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) == 0
}
