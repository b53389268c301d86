//! Handle to a spawned worker process.
//!
//! Owns the worker's pipe ends and its wait-status bookkeeping: drain
//! requests go down the control pipe, ready/heartbeat reports come back up,
//! and termination escalates SIGTERM then SIGKILL.

use std::io;
use std::os::unix::io::OwnedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::ipc::{Frame, FrameReader, FrameWriter, Pipe};
use super::protocol::ControlMessage;
use crate::error::{PreforkdError, Result};

/// Grace given on drop before escalating to SIGKILL.
const DROP_GRACE: Duration = Duration::from_millis(10);

/// A live (or recently exited) worker subprocess.
pub struct WorkerChild {
    pid: Pid,
    /// To the worker's stdin.
    control: FrameWriter,
    /// From the worker's stdout, non-blocking.
    reports: FrameReader,
    /// Final wait status once collected; also the "already reaped" marker.
    waited: Option<WaitStatus>,
    killed: bool,
}

impl WorkerChild {
    /// Take over a freshly spawned child whose stdin and stdout are piped.
    pub fn adopt(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let (stdin, stdout) = child
            .stdin
            .take()
            .zip(child.stdout.take())
            .ok_or_else(|| PreforkdError::Worker("Worker pipes were not captured".into()))?;

        let reports_pipe = Pipe::from_owned(OwnedFd::from(stdout));
        reports_pipe.set_nonblocking()?;

        Ok(Self {
            pid,
            control: FrameWriter::new(Pipe::from_owned(OwnedFd::from(stdin))),
            reports: FrameReader::new(reports_pipe),
            waited: None,
            killed: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether our own SIGKILL was sent, for exit-cause attribution.
    pub fn was_killed(&self) -> bool {
        self.killed
    }

    /// Push a control message down the worker's stdin.
    pub fn send_control(&mut self, message: &ControlMessage) -> Result<()> {
        self.control
            .send(&message.to_line())
            .map_err(|e| PreforkdError::Worker(format!("Control write to worker failed: {}", e)))
    }

    /// Next report frame from the worker, without blocking.
    pub fn next_report(&mut self) -> io::Result<Frame> {
        self.reports.try_next()
    }

    /// Collect the exit status if the process has terminated.
    ///
    /// Returns the status exactly once; later calls (and calls while the
    /// process runs) return `None`.
    pub fn status(&mut self) -> Result<Option<WaitStatus>> {
        if self.waited.is_some() {
            return Ok(None);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.waited = Some(status);
                Ok(Some(status))
            }
            Err(Errno::ECHILD) => {
                // Someone else collected it; treat as gone
                self.waited = Some(WaitStatus::StillAlive);
                Ok(None)
            }
            Err(e) => Err(PreforkdError::Worker(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    pub fn alive(&mut self) -> bool {
        matches!(self.status(), Ok(None)) && self.waited.is_none()
    }

    /// Ask the OS to terminate the worker (SIGTERM).
    pub fn request_term(&self) -> Result<()> {
        if self.waited.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| PreforkdError::Worker(format!("SIGTERM to {} failed: {}", self.pid, e)))
    }

    /// SIGKILL the worker and reap it synchronously.
    pub fn force_kill(&mut self) -> Result<()> {
        if self.waited.is_some() {
            return Ok(());
        }
        self.killed = true;
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| PreforkdError::Worker(format!("SIGKILL to {} failed: {}", self.pid, e)))?;
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.waited = Some(status);
                Ok(())
            }
            Err(e) => Err(PreforkdError::Worker(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }
}

impl Drop for WorkerChild {
    /// Leave no orphans: a still-running worker gets SIGTERM, a short grace,
    /// then SIGKILL.
    fn drop(&mut self) {
        if self.waited.is_some() {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGTERM);
        std::thread::sleep(DROP_GRACE);
        if let Ok(status) = waitpid(self.pid, Some(WaitPidFlag::WNOHANG))
            && status != WaitStatus::StillAlive
        {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}
