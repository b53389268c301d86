//! Worker process entry point.
//!
//! Runs in the hidden `worker` mode of the binary, launched by the
//! supervisor. The worker inherits the shared listening socket by file
//! descriptor, reports readiness and periodic heartbeats on stdout, and
//! watches stdin for drain requests. Loss of either pipe means the
//! supervisor is gone and the worker exits on its own.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::Pid;

use super::ipc::{Frame, FrameReader, FrameWriter, Pipe};
use super::launcher::{APP_STATE_ENV, AppState, SOCKET_FD_ENV, TIMEOUT_ENV, WORKER_ID_ENV};
use super::protocol::{ControlMessage, WorkerMessage};
use crate::config::environment_from_env;
use crate::error::{PreforkdError, Result};

/// Set by the SIGTERM handler; the accept loop checks it between requests.
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_sig: c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Everything a worker needs, reconstructed from its environment.
struct WorkerContext {
    id: u32,
    timeout: Duration,
    state: AppState,
    listener: TcpListener,
}

impl WorkerContext {
    fn from_env() -> Result<Self> {
        let fd: RawFd = std::env::var(SOCKET_FD_ENV)
            .map_err(|_| {
                PreforkdError::Worker(format!(
                    "{} is not set; worker mode must be launched by the supervisor",
                    SOCKET_FD_ENV
                ))
            })?
            .parse()
            .map_err(|e| PreforkdError::Worker(format!("Invalid {}: {}", SOCKET_FD_ENV, e)))?;

        let id: u32 = match std::env::var(WORKER_ID_ENV) {
            Ok(v) => v
                .parse()
                .map_err(|e| PreforkdError::Worker(format!("Invalid {}: {}", WORKER_ID_ENV, e)))?,
            Err(_) => 0,
        };

        let timeout_secs: u64 = match std::env::var(TIMEOUT_ENV) {
            Ok(v) => v
                .parse()
                .map_err(|e| PreforkdError::Worker(format!("Invalid {}: {}", TIMEOUT_ENV, e)))?,
            Err(_) => 30,
        };

        // Preload mode hands us an already-initialized image; otherwise we
        // initialize for ourselves.
        let state = match std::env::var(APP_STATE_ENV) {
            Ok(raw) => {
                let state = AppState::from_env_value(&raw)?;
                tracing::debug!(worker_id = id, "Inherited warm application image");
                state
            }
            Err(_) => {
                tracing::debug!(worker_id = id, "Cold-initializing application image");
                AppState {
                    environment: environment_from_env(),
                    timeout_secs,
                }
            }
        };

        // Safety: the supervisor passed us this fd and nothing else in this
        // process owns it.
        let listener = unsafe { TcpListener::from_raw_fd(fd) };
        listener.set_nonblocking(true).map_err(PreforkdError::Io)?;

        Ok(Self {
            id,
            timeout: Duration::from_secs(timeout_secs),
            state,
            listener,
        })
    }
}

/// Heartbeat cadence: a quarter of the request timeout, clamped so very
/// short or very long timeouts still produce sane intervals.
fn heartbeat_interval(timeout: Duration) -> Duration {
    (timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(10))
}

fn install_signal_handlers() -> Result<()> {
    let term = SigAction::new(
        SigHandler::Handler(on_term),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGTERM, &term)
            .map_err(|e| PreforkdError::Worker(format!("Failed to install SIGTERM handler: {}", e)))?;
        // Broken-pipe writes must surface as errors, not kill the process
        sigaction(Signal::SIGPIPE, &ignore)
            .map_err(|e| PreforkdError::Worker(format!("Failed to ignore SIGPIPE: {}", e)))?;
    }
    Ok(())
}

/// Serve one connection with a minimal HTTP/1.1 response.
fn handle_connection(mut stream: TcpStream, id: u32, state: &AppState) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    // Drain the request head; we do not care about its contents
    let mut buf = [0u8; 4096];
    let mut head = Vec::new();
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") || head.len() > 16 * 1024 {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    let body = format!(
        "worker {} pid {} env {}\n",
        id,
        Pid::this(),
        state.environment
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// Worker main loop. Returns when asked to drain, on SIGTERM, or when the
/// supervisor disappears.
pub fn run() -> Result<()> {
    let ctx = WorkerContext::from_env()?;
    install_signal_handlers()?;

    // Safety: stdin/stdout belong to this process and are not used by
    // anything else once worker mode starts; tracing writes to stderr.
    let mut control = FrameReader::new(unsafe { Pipe::claim_raw(0) });
    control.pipe().set_nonblocking().map_err(PreforkdError::Io)?;
    let mut reports = FrameWriter::new(unsafe { Pipe::claim_raw(1) });

    let interval = heartbeat_interval(ctx.timeout);
    tracing::info!(
        worker_id = ctx.id,
        pid = Pid::this().as_raw(),
        environment = %ctx.state.environment,
        heartbeat_secs = interval.as_secs(),
        "Worker started"
    );

    reports
        .send(&WorkerMessage::Ready.to_line())
        .map_err(|e| PreforkdError::Worker(format!("Failed to report ready: {}", e)))?;

    let mut last_heartbeat = Instant::now();

    loop {
        if STOP.load(Ordering::SeqCst) {
            tracing::info!(worker_id = ctx.id, "Stopping on SIGTERM");
            break;
        }

        match control.try_next() {
            Ok(Frame::Complete(line)) => match ControlMessage::from_line(&line) {
                Ok(ControlMessage::Quit) => {
                    tracing::info!(worker_id = ctx.id, "Draining on supervisor request");
                    break;
                }
                Err(e) => {
                    tracing::warn!(worker_id = ctx.id, line = %line, error = %e, "Unparseable control message");
                }
            },
            Ok(Frame::Incomplete) => {}
            Ok(Frame::Eof) => {
                tracing::warn!(worker_id = ctx.id, "Supervisor pipe closed, exiting");
                break;
            }
            Err(e) => {
                tracing::warn!(worker_id = ctx.id, error = %e, "Control pipe read failed, exiting");
                break;
            }
        }

        if last_heartbeat.elapsed() >= interval {
            if reports
                .send(&WorkerMessage::heartbeat(false).to_line())
                .is_err()
            {
                tracing::warn!(worker_id = ctx.id, "Heartbeat write failed, exiting");
                break;
            }
            last_heartbeat = Instant::now();
        }

        match ctx.listener.accept() {
            Ok((stream, peer)) => {
                // Announce the request so a stall mid-request reads as a
                // missed heartbeat rather than idleness
                let _ = reports.send(&WorkerMessage::heartbeat(true).to_line());
                tracing::debug!(worker_id = ctx.id, peer = %peer, "Handling connection");
                if let Err(e) = handle_connection(stream, ctx.id, &ctx.state) {
                    tracing::warn!(worker_id = ctx.id, error = %e, "Connection failed");
                }
                let _ = reports.send(&WorkerMessage::heartbeat(false).to_line());
                last_heartbeat = Instant::now();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                tracing::warn!(worker_id = ctx.id, error = %e, "Accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    tracing::info!(worker_id = ctx.id, "Worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_interval_is_quarter_timeout() {
        assert_eq!(
            heartbeat_interval(Duration::from_secs(30)),
            Duration::from_secs(7) + Duration::from_millis(500)
        );
    }

    #[test]
    fn test_heartbeat_interval_clamps() {
        assert_eq!(heartbeat_interval(Duration::from_secs(2)), Duration::from_secs(1));
        assert_eq!(
            heartbeat_interval(Duration::from_secs(3600)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_handle_connection_writes_http_response() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState {
            environment: "test".into(),
            timeout_secs: 30,
        };

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
            let mut out = String::new();
            stream.read_to_string(&mut out).unwrap();
            out
        });

        let (stream, _) = listener.accept().unwrap();
        handle_connection(stream, 7, &state).unwrap();
        drop(listener);

        let response = client.join().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("worker 7"));
        assert!(response.contains("env test"));
    }
}
