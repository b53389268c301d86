//! Wire protocol between supervisor and worker processes.
//!
//! Messages are JSON-serialized and newline-delimited. Workers write
//! [`WorkerMessage`]s on stdout; the supervisor writes [`ControlMessage`]s
//! on the worker's stdin.

use serde::{Deserialize, Serialize};

/// Message from worker to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Worker finished initialization and is accepting work.
    #[serde(rename = "ready")]
    Ready,

    /// Periodic liveness signal.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        /// Whether the worker is currently handling a request.
        busy: bool,
    },
}

/// Message from supervisor to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Stop accepting new work and exit after in-flight requests finish.
    #[serde(rename = "quit")]
    Quit,
}

impl WorkerMessage {
    /// Create a heartbeat message.
    pub fn heartbeat(busy: bool) -> Self {
        Self::Heartbeat { busy }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkerMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl ControlMessage {
    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("ControlMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_roundtrip() {
        let line = WorkerMessage::Ready.to_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains("ready"));
        assert_eq!(WorkerMessage::from_line(&line).unwrap(), WorkerMessage::Ready);
    }

    #[test]
    fn test_heartbeat_carries_busy_flag() {
        let line = WorkerMessage::heartbeat(true).to_line();
        match WorkerMessage::from_line(&line).unwrap() {
            WorkerMessage::Heartbeat { busy } => assert!(busy),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_quit_roundtrip() {
        let line = ControlMessage::Quit.to_line();
        assert_eq!(ControlMessage::from_line(&line).unwrap(), ControlMessage::Quit);
    }

    #[test]
    fn test_garbage_line_is_error() {
        assert!(WorkerMessage::from_line("not json").is_err());
        assert!(ControlMessage::from_line("{\"type\":\"unknown\"}").is_err());
    }
}
