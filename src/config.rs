//! Pool configuration resolution.
//!
//! Derives runtime parameters (worker count, request timeout, preload flag)
//! from a named environment, with explicit overrides taking precedence.
//!
//! Policy table:
//!
//! | environment  | workers | timeout | preload |
//! |--------------|---------|---------|---------|
//! | `production` | 6       | 30s     | true    |
//! | anything else| 1       | 30s     | true    |

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PreforkdError, Result};

/// Environment variable selecting the named environment.
pub const ENV_VAR: &str = "PREFORKD_ENV";

/// Worker count for the `production` environment.
const PRODUCTION_WORKERS: usize = 6;

/// Worker count for every non-production environment.
const DEVELOPMENT_WORKERS: usize = 1;

/// Request timeout applied uniformly across environments.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default listen address for the shared socket.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Fully-resolved pool configuration.
///
/// Created at process start and on explicit reload; immutable between
/// reloads; owned exclusively by the supervisor loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    /// Named environment this configuration was derived from.
    pub environment: String,
    /// Desired number of worker processes.
    pub worker_count: usize,
    /// Uniform request timeout; also the heartbeat deadline and the
    /// upper bound on graceful-drain grace periods.
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    /// Whether to warm the application image once in the supervisor and
    /// hand it to workers, instead of per-worker initialization.
    pub preload_app: bool,
    /// Address of the shared listening socket.
    pub bind_addr: SocketAddr,
}

impl PoolConfig {
    /// Request timeout in whole seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.request_timeout.as_secs()
    }
}

mod secs {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// Partial configuration supplied by the operator.
///
/// `worker_count` and `timeout_secs` are signed so that out-of-range values
/// reach validation instead of failing at the parsing layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    pub worker_count: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub preload_app: Option<bool>,
    pub bind_addr: Option<SocketAddr>,
}

impl Overrides {
    /// True if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Resolve a [`PoolConfig`] from an environment name plus overrides.
///
/// Pure function of its inputs. Fails with a config error if an override
/// supplies a negative worker count or a non-positive timeout.
pub fn resolve(environment: &str, overrides: &Overrides) -> Result<PoolConfig> {
    let default_workers = if environment == "production" {
        PRODUCTION_WORKERS
    } else {
        DEVELOPMENT_WORKERS
    };

    let worker_count = match overrides.worker_count {
        Some(n) if n < 0 => {
            return Err(PreforkdError::Config(format!(
                "worker_count must be >= 0, got {}",
                n
            )));
        }
        Some(n) => n as usize,
        None => default_workers,
    };

    let timeout_secs = match overrides.timeout_secs {
        Some(t) if t <= 0 => {
            return Err(PreforkdError::Config(format!(
                "timeout must be > 0 seconds, got {}",
                t
            )));
        }
        Some(t) => t as u64,
        None => DEFAULT_TIMEOUT_SECS,
    };

    let bind_addr = match overrides.bind_addr {
        Some(addr) => addr,
        None => DEFAULT_BIND_ADDR
            .parse()
            .expect("default bind address is valid"),
    };

    Ok(PoolConfig {
        environment: environment.to_string(),
        worker_count,
        request_timeout: Duration::from_secs(timeout_secs),
        preload_app: overrides.preload_app.unwrap_or(true),
        bind_addr,
    })
}

/// Read the environment name from the process environment.
///
/// Defaults to `production` when the variable is unset or empty.
pub fn environment_from_env() -> String {
    match std::env::var(ENV_VAR) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => "production".to_string(),
    }
}
