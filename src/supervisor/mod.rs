//! Pre-forking worker pool supervision.
//!
//! A supervisor process binds the listening socket once, launches a fixed
//! number of worker subprocesses that inherit it, and keeps the pool healthy:
//! crashed workers are relaunched, hung workers (no heartbeat within the
//! request timeout) are force-killed and replaced, and configuration reloads
//! roll new workers in while old ones drain out.
//!
//! Workers talk to the supervisor over their stdin/stdout pipes with a
//! line-delimited JSON protocol; POSIX signals drive the operator surface
//! (reload, scale, drain, status).

pub mod child;
pub mod control;
pub mod exit;
pub mod ipc;
pub mod launcher;
pub mod pool;
pub mod protocol;
pub mod slot;
pub mod worker_main;

pub use control::{control_channel, spawn_signal_watcher};
pub use launcher::ProcessLauncher;
pub use pool::Supervisor;
