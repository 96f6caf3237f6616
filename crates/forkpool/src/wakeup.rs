//! Self-pipe between the signal dispatch thread and the assignment loop.
//!
//! The channel only carries bytes, so each signal class is encoded as one
//! ASCII digit:
//!
//! | byte  | signal    | meaning      |
//! |-------|-----------|--------------|
//! | `'1'` | `SIGCHLD` | child exited |
//! | `'2'` | `SIGINT`  | interrupt    |
//! | `'3'` | `SIGQUIT` | quit         |
//! | `'4'` | `SIGTERM` | terminate    |
//! | `'5'` | `SIGUSR1` | reopen logs  |

use std::io::{self, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::net::UnixStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalCode {
    ChildExit,
    Interrupt,
    Quit,
    Terminate,
    ReopenLogs,
}

impl SignalCode {
    pub const ALL: [SignalCode; 5] = [
        SignalCode::ChildExit,
        SignalCode::Interrupt,
        SignalCode::Quit,
        SignalCode::Terminate,
        SignalCode::ReopenLogs,
    ];

    pub fn as_byte(self) -> u8 {
        match self {
            SignalCode::ChildExit => b'1',
            SignalCode::Interrupt => b'2',
            SignalCode::Quit => b'3',
            SignalCode::Terminate => b'4',
            SignalCode::ReopenLogs => b'5',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_byte() == byte)
    }

    pub fn signal(self) -> Signal {
        match self {
            SignalCode::ChildExit => Signal::SIGCHLD,
            SignalCode::Interrupt => Signal::SIGINT,
            SignalCode::Quit => Signal::SIGQUIT,
            SignalCode::Terminate => Signal::SIGTERM,
            SignalCode::ReopenLogs => Signal::SIGUSR1,
        }
    }

    pub fn from_signal(signal: Signal) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.signal() == signal)
    }

    /// Interrupt, quit and terminate all mean "shut the pool down".
    pub fn is_shutdown(self) -> bool {
        matches!(
            self,
            SignalCode::Interrupt | SignalCode::Quit | SignalCode::Terminate
        )
    }
}

/// Write half, handed to signal handlers.
#[derive(Clone)]
pub struct WakeupSender {
    stream: Arc<StdUnixStream>,
}

impl WakeupSender {
    /// Queue one code. A full buffer already guarantees a wakeup, so
    /// `WouldBlock` is not an error.
    pub fn notify(&self, code: SignalCode) -> io::Result<()> {
        match (&*self.stream).write(&[code.as_byte()]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Read half, polled by the assignment loop alongside worker sockets.
pub struct WakeupReceiver {
    stream: UnixStream,
}

impl WakeupReceiver {
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Take every buffered code without waiting.
    ///
    /// Unknown bytes are logged and skipped.
    pub fn drain(&mut self) -> io::Result<Vec<SignalCode>> {
        let mut codes = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "wakeup channel closed",
                    ));
                }
                Ok(n) => {
                    for &byte in &buf[..n] {
                        match SignalCode::from_byte(byte) {
                            Some(code) => codes.push(code),
                            None => tracing::warn!(byte, "Unknown wakeup byte"),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(codes),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build a connected wakeup pair. Must be called inside a tokio runtime.
pub fn wakeup_channel() -> io::Result<(WakeupSender, WakeupReceiver)> {
    let (reader, writer) = StdUnixStream::pair()?;
    reader.set_nonblocking(true)?;
    writer.set_nonblocking(true)?;
    Ok((
        WakeupSender {
            stream: Arc::new(writer),
        },
        WakeupReceiver {
            stream: UnixStream::from_std(reader)?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_fixed() {
        let bytes: Vec<u8> = SignalCode::ALL.iter().map(|c| c.as_byte()).collect();
        assert_eq!(bytes, b"12345");
        assert_eq!(SignalCode::from_byte(b'4'), Some(SignalCode::Terminate));
        assert_eq!(SignalCode::from_byte(b'9'), None);
        assert_eq!(
            SignalCode::from_signal(Signal::SIGCHLD),
            Some(SignalCode::ChildExit)
        );
        assert_eq!(SignalCode::from_signal(Signal::SIGHUP), None);
    }

    #[test]
    fn only_termination_classes_shut_down() {
        assert!(SignalCode::Quit.is_shutdown());
        assert!(!SignalCode::ChildExit.is_shutdown());
        assert!(!SignalCode::ReopenLogs.is_shutdown());
    }

    #[tokio::test]
    async fn codes_arrive_in_order() {
        let (tx, mut rx) = wakeup_channel().unwrap();
        tx.notify(SignalCode::ChildExit).unwrap();
        tx.notify(SignalCode::Terminate).unwrap();

        rx.stream().readable().await.unwrap();
        assert_eq!(
            rx.drain().unwrap(),
            vec![SignalCode::ChildExit, SignalCode::Terminate]
        );
        assert!(rx.drain().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_sender_is_reported() {
        let (tx, mut rx) = wakeup_channel().unwrap();
        drop(tx);
        rx.stream().readable().await.unwrap();
        assert_eq!(rx.drain().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
