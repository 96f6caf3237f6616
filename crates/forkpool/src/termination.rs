//! Classification of reaped worker exit statuses.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// SIGKILL: either our own shutdown escalation or the OOM killer.
    Killed,
    /// SIGSEGV, SIGBUS or SIGABRT.
    Crashed(Signal),
    /// Any other fatal signal.
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Workers always exit 0 when they stop on purpose (shutdown, orphaned,
    /// resource ceiling, deadline overrun).
    pub fn is_planned(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn has_exited(&self) -> bool {
        !matches!(self, Self::StillAlive)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Killed => write!(f, "killed (SIGKILL, possibly out of memory)"),
            Self::Crashed(sig) => write!(f, "crashed with {:?}", sig),
            Self::Signaled(sig) => write!(f, "terminated by {:?}", sig),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown status"),
        }
    }
}

pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::Killed,
        WaitStatus::Signaled(_, sig @ (Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT), _) => {
            TerminationReason::Crashed(sig)
        }
        WaitStatus::Signaled(_, sig, _) => TerminationReason::Signaled(sig),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn classifies_statuses() {
        let pid = Pid::from_raw(4242);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 0)),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Killed
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::Crashed(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert!(!analyze_wait_status(WaitStatus::StillAlive).has_exited());
    }

    #[test]
    fn only_clean_exit_is_planned() {
        assert!(TerminationReason::Exited(0).is_planned());
        assert!(!TerminationReason::Exited(1).is_planned());
        assert!(!TerminationReason::Killed.is_planned());
    }
}
