//! Worker process launching.
//!
//! The launcher owns the shared listening socket (bound once, before any
//! worker exists) and starts workers by re-executing the current binary in
//! worker mode, the pipes carrying the heartbeat/control protocol.
//!
//! With `preload_app` enabled, the application image is initialized once in
//! the supervisor and the resulting state is handed to every worker, which
//! then skips its own initialization. Without it, each worker initializes
//! independently. This keeps the warm-image optimization portable instead of
//! leaning on any single OS's process-duplication primitive.

use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::fcntl::{F_SETFD, FdFlag, fcntl};
use serde::{Deserialize, Serialize};

use super::child::WorkerChild;
use super::exit::{ExitCause, analyze_wait_status};
use super::ipc::Frame;
use super::protocol::{ControlMessage, WorkerMessage};
use crate::config::PoolConfig;
use crate::error::{PreforkdError, Result};

/// Env var carrying the inherited listening socket fd.
pub const SOCKET_FD_ENV: &str = "PREFORKD_SOCKET_FD";
/// Env var carrying the slot id, for worker-side logging.
pub const WORKER_ID_ENV: &str = "PREFORKD_WORKER_ID";
/// Env var carrying the request timeout in seconds.
pub const TIMEOUT_ENV: &str = "PREFORKD_TIMEOUT_SECS";
/// Env var carrying the pre-initialized application state (preload mode).
pub const APP_STATE_ENV: &str = "PREFORKD_APP_STATE";

/// Observation produced by polling a worker handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerEvent {
    /// Worker finished initialization.
    Ready,
    /// Worker liveness signal.
    Heartbeat { busy: bool },
    /// Worker process exited.
    Exited(ExitCause),
}

/// Initialized application state, shared by all workers in preload mode.
///
/// Workers that inherit this skip their own initialization, trading one
/// initialization in the supervisor for N in the workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    pub environment: String,
    pub timeout_secs: u64,
}

impl AppState {
    /// Initialize the application image from the pool configuration.
    ///
    /// Failure here is a launch error: the pool cannot start workers from a
    /// broken image.
    pub fn initialize(config: &PoolConfig) -> Result<Self> {
        let state = Self {
            environment: config.environment.clone(),
            timeout_secs: config.timeout_secs(),
        };
        tracing::debug!(environment = %state.environment, "Application image initialized");
        Ok(state)
    }

    /// Serialize for handing to a worker via the environment.
    pub fn to_env_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild from the inherited environment value.
    pub fn from_env_value(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

/// Abstraction over worker process launching and observation.
///
/// The production implementation is [`ProcessLauncher`]; the supervisor loop
/// is written against this trait so its reconciliation logic can be tested
/// without real processes.
pub trait WorkerLauncher {
    type Handle;

    /// Start a worker for the given slot. Fails with a launch error if the
    /// process cannot be spawned; the supervisor retries with backoff.
    fn launch(&mut self, id: u32, config: &PoolConfig) -> Result<Self::Handle>;

    /// Ask the worker to stop accepting work and exit after in-flight
    /// requests finish.
    fn signal_quit(&mut self, handle: &mut Self::Handle);

    /// Kill the worker immediately and reap it.
    fn kill(&mut self, handle: &mut Self::Handle);

    /// Collect pending observations (heartbeats, exit) without blocking.
    fn poll(&mut self, handle: &mut Self::Handle) -> Vec<WorkerEvent>;

    /// OS process id, if the handle maps to a real process.
    fn pid(&self, _handle: &Self::Handle) -> Option<i32> {
        None
    }

    /// Adopt a changed configuration before a rolling replace. Workers
    /// launched afterwards must reflect it; workers already running keep
    /// whatever they were launched with.
    fn reconfigure(&mut self, _config: &PoolConfig) -> Result<()> {
        Ok(())
    }
}

/// Launches workers as real subprocesses sharing one listening socket.
#[derive(Debug)]
pub struct ProcessLauncher {
    listener: TcpListener,
    exe: PathBuf,
    warm: Option<AppState>,
}

impl ProcessLauncher {
    /// Bind the shared listening socket and prepare for launching.
    ///
    /// The socket must exist before any worker so that restarted workers
    /// resume accepting connections with zero listener downtime. A bind
    /// failure is fatal to the whole pool.
    pub fn bind(config: &PoolConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).map_err(|source| {
            PreforkdError::SocketBind {
                addr: config.bind_addr,
                source,
            }
        })?;

        // The fd must survive exec so workers can inherit it
        fcntl(&listener, F_SETFD(FdFlag::empty()))
            .map_err(|e| PreforkdError::Launch(format!("Failed to clear CLOEXEC: {}", e)))?;

        let exe = std::env::current_exe()
            .map_err(|e| PreforkdError::Launch(format!("Failed to get current executable: {}", e)))?;

        let warm = if config.preload_app {
            Some(AppState::initialize(config)?)
        } else {
            None
        };

        tracing::info!(
            addr = %config.bind_addr,
            preload = config.preload_app,
            "Listening socket bound"
        );

        Ok(Self {
            listener,
            exe,
            warm,
        })
    }

    /// Local address of the shared socket.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Re-warm the application image after a config reload.
    pub fn rewarm(&mut self, config: &PoolConfig) -> Result<()> {
        self.warm = if config.preload_app {
            Some(AppState::initialize(config)?)
        } else {
            None
        };
        Ok(())
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Handle = WorkerChild;

    fn launch(&mut self, id: u32, config: &PoolConfig) -> Result<WorkerChild> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("worker");
        cmd.env(SOCKET_FD_ENV, self.listener.as_raw_fd().to_string());
        cmd.env(WORKER_ID_ENV, id.to_string());
        cmd.env(TIMEOUT_ENV, config.timeout_secs().to_string());
        match &self.warm {
            Some(state) => {
                cmd.env(APP_STATE_ENV, state.to_env_value()?);
            }
            None => {
                cmd.env_remove(APP_STATE_ENV);
            }
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Worker errors go to the supervisor's stderr

        let child = cmd
            .spawn()
            .map_err(|e| PreforkdError::Launch(format!("Failed to spawn worker {}: {}", id, e)))?;

        let worker = WorkerChild::adopt(child)?;
        tracing::debug!(worker_id = id, pid = worker.pid().as_raw(), "Worker launched");
        Ok(worker)
    }

    fn signal_quit(&mut self, handle: &mut WorkerChild) {
        if let Err(e) = handle.send_control(&ControlMessage::Quit) {
            // Control pipe is gone; fall back to the signal path
            tracing::debug!(pid = handle.pid().as_raw(), error = %e, "Quit message failed, sending SIGTERM");
            let _ = handle.request_term();
        }
    }

    fn kill(&mut self, handle: &mut WorkerChild) {
        if let Err(e) = handle.force_kill() {
            tracing::warn!(pid = handle.pid().as_raw(), error = %e, "Failed to kill worker");
        }
    }

    fn poll(&mut self, handle: &mut WorkerChild) -> Vec<WorkerEvent> {
        let mut events = Vec::new();

        loop {
            match handle.next_report() {
                Ok(Frame::Complete(line)) => match WorkerMessage::from_line(&line) {
                    Ok(WorkerMessage::Ready) => events.push(WorkerEvent::Ready),
                    Ok(WorkerMessage::Heartbeat { busy }) => {
                        events.push(WorkerEvent::Heartbeat { busy });
                    }
                    Err(e) => {
                        tracing::warn!(
                            pid = handle.pid().as_raw(),
                            line = %line,
                            error = %e,
                            "Unparseable worker message"
                        );
                    }
                },
                Ok(Frame::Incomplete) | Ok(Frame::Eof) => break,
                Err(e) => {
                    tracing::warn!(pid = handle.pid().as_raw(), error = %e, "Worker pipe read failed");
                    break;
                }
            }
        }

        match handle.status() {
            Ok(Some(status)) => {
                events.push(WorkerEvent::Exited(analyze_wait_status(
                    status,
                    handle.was_killed(),
                )));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(pid = handle.pid().as_raw(), error = %e, "Worker wait failed");
            }
        }

        events
    }

    fn pid(&self, handle: &WorkerChild) -> Option<i32> {
        Some(handle.pid().as_raw())
    }

    fn reconfigure(&mut self, config: &PoolConfig) -> Result<()> {
        self.rewarm(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Overrides, resolve};

    fn test_config() -> PoolConfig {
        let overrides = Overrides {
            worker_count: Some(2),
            bind_addr: Some("127.0.0.1:0".parse().unwrap()),
            ..Default::default()
        };
        resolve("test", &overrides).unwrap()
    }

    #[test]
    fn test_app_state_roundtrip() {
        let config = test_config();
        let state = AppState::initialize(&config).unwrap();
        let env_value = state.to_env_value().unwrap();
        let restored = AppState::from_env_value(&env_value).unwrap();
        assert_eq!(restored.environment, "test");
        assert_eq!(restored.timeout_secs, 30);
    }

    #[test]
    fn test_bind_on_ephemeral_port() {
        let config = test_config();
        let launcher = ProcessLauncher::bind(&config).unwrap();
        assert_ne!(launcher.local_addr().unwrap().port(), 0);
        assert!(launcher.warm.is_some());
    }

    #[test]
    fn test_bind_conflict_is_socket_bind_error() {
        let config = test_config();
        let first = ProcessLauncher::bind(&config).unwrap();
        let mut conflicting = test_config();
        conflicting.bind_addr = first.local_addr().unwrap();
        let err = ProcessLauncher::bind(&conflicting).unwrap_err();
        assert!(matches!(err, PreforkdError::SocketBind { .. }));
    }

    #[test]
    fn test_no_warm_image_without_preload() {
        let mut config = test_config();
        config.preload_app = false;
        let launcher = ProcessLauncher::bind(&config).unwrap();
        assert!(launcher.warm.is_none());
    }

    // Launching real workers needs the compiled binary's `worker` mode and is
    // covered by the CLI integration tests.
}
