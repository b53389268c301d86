//! Exit-status analysis for worker processes.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Likely out of memory (SIGKILL from the OOM killer, not from us).
    OutOfMemory,
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl ExitCause {
    /// Check if this is a voluntary clean exit.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for ExitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            Self::OutOfMemory => write!(f, "out of memory (SIGKILL from OOM killer)"),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Analyze a `WaitStatus` to determine the exit cause.
///
/// `killed_by_us` distinguishes our own SIGKILL escalation from the kernel
/// OOM killer, which uses the same signal.
pub fn analyze_wait_status(status: WaitStatus, killed_by_us: bool) -> ExitCause {
    match status {
        WaitStatus::Exited(_, code) => ExitCause::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) if !killed_by_us => ExitCause::OutOfMemory,
        WaitStatus::Signaled(_, signal, _) => ExitCause::Signaled(signal),
        WaitStatus::StillAlive => ExitCause::StillAlive,
        _ => ExitCause::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_clean_exit() {
        assert!(ExitCause::Exited(0).is_clean());
        assert!(!ExitCause::Exited(1).is_clean());
        assert!(!ExitCause::OutOfMemory.is_clean());
    }

    #[test]
    fn test_analyze_exited() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 3);
        assert_eq!(analyze_wait_status(status, false), ExitCause::Exited(3));
    }

    #[test]
    fn test_sigkill_attribution() {
        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(analyze_wait_status(status, false), ExitCause::OutOfMemory);
        assert_eq!(
            analyze_wait_status(status, true),
            ExitCause::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_analyze_sigterm() {
        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGTERM, false);
        assert_eq!(
            analyze_wait_status(status, false),
            ExitCause::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn test_display() {
        assert!(ExitCause::Exited(0).to_string().contains("code 0"));
        assert!(ExitCause::OutOfMemory.to_string().contains("OOM"));
    }
}
