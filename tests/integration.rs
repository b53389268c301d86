//! Integration tests for the preforkd CLI.
//!
//! These tests exercise the binary end-to-end: configuration resolution via
//! `check`, argument validation, completions, and the guard rails of the
//! hidden worker mode.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the preforkd binary with a scrubbed environment.
fn preforkd() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("preforkd").unwrap();
    for var in [
        "PREFORKD_ENV",
        "PREFORKD_WORKERS",
        "PREFORKD_TIMEOUT",
        "PREFORKD_BIND",
        "PREFORKD_SOCKET_FD",
        "PREFORKD_WORKER_ID",
        "PREFORKD_TIMEOUT_SECS",
        "PREFORKD_APP_STATE",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_check_defaults_to_production() {
    preforkd()
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("environment: production"))
        .stdout(predicate::str::contains("workers: 6"))
        .stdout(predicate::str::contains("timeout: 30s"))
        .stdout(predicate::str::contains("preload: true"));
}

#[test]
fn test_check_non_production_gets_one_worker() {
    preforkd()
        .args(["check", "--env", "development"])
        .assert()
        .success()
        .stdout(predicate::str::contains("environment: development"))
        .stdout(predicate::str::contains("workers: 1"));
}

#[test]
fn test_check_reads_environment_variable() {
    preforkd()
        .arg("check")
        .env("PREFORKD_ENV", "staging")
        .assert()
        .success()
        .stdout(predicate::str::contains("environment: staging"))
        .stdout(predicate::str::contains("workers: 1"));
}

#[test]
fn test_check_flag_beats_environment_variable() {
    preforkd()
        .args(["check", "--env", "production"])
        .env("PREFORKD_ENV", "staging")
        .assert()
        .success()
        .stdout(predicate::str::contains("workers: 6"));
}

#[test]
fn test_check_applies_overrides() {
    preforkd()
        .args(["check", "--workers", "12", "--timeout", "5", "--no-preload"])
        .assert()
        .success()
        .stdout(predicate::str::contains("workers: 12"))
        .stdout(predicate::str::contains("timeout: 5s"))
        .stdout(predicate::str::contains("preload: false"));
}

#[test]
fn test_check_rejects_negative_workers() {
    preforkd()
        .args(["check", "--workers", "-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker_count"));
}

#[test]
fn test_check_rejects_zero_timeout() {
    preforkd()
        .args(["check", "--timeout", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timeout"));
}

#[test]
fn test_run_fails_on_unbindable_address() {
    // TEST-NET-3 address is not assigned to any local interface
    preforkd()
        .args(["run", "--env", "test", "--bind", "203.0.113.1:9"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(predicate::str::contains("203.0.113.1:9"));
}

#[test]
fn test_worker_mode_requires_supervisor() {
    preforkd()
        .arg("worker")
        .assert()
        .failure()
        .stderr(predicate::str::contains("PREFORKD_SOCKET_FD"));
}

#[test]
fn test_help_shows_commands() {
    preforkd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_completions_bash() {
    preforkd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("preforkd"));
}

#[test]
fn test_run_serves_requests_end_to_end() {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::process::{Command as StdCommand, Stdio};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    // Grab a free port, then hand it to the supervisor
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr = format!("127.0.0.1:{}", port);
    let logs = tempdir().unwrap();

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin("preforkd"))
        .args(["run", "--env", "test", "--workers", "1", "--bind", &addr])
        .env("PREFORKD_LOG_FILE", logs.path().join("preforkd.log"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // The socket binds before any worker exists; keep asking until a worker
    // picks the connection up and answers
    let deadline = Instant::now() + Duration::from_secs(15);
    let body;
    loop {
        if let Ok(mut stream) = TcpStream::connect(&addr) {
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            if stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").is_ok() {
                let mut out = String::new();
                let _ = stream.read_to_string(&mut out);
                if out.contains("worker 0") {
                    body = out;
                    break;
                }
            }
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("no worker answered before the deadline");
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    assert!(body.starts_with("HTTP/1.1 200 OK"));
    assert!(body.contains("env test"));
    assert!(
        std::fs::read_dir(logs.path()).unwrap().next().is_some(),
        "expected a log file to be written"
    );

    child.kill().unwrap();
    let _ = child.wait();
}

#[test]
fn test_version_flag() {
    preforkd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("preforkd"));
}
