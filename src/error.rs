//! Error types for preforkd.

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for preforkd.
#[derive(Error, Debug)]
pub enum PreforkdError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to launch worker: {0}")]
    Launch(String),

    #[error("Failed to bind listening socket {addr}: {source}")]
    SocketBind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for preforkd operations.
pub type Result<T> = std::result::Result<T, PreforkdError>;
