//! Logging setup on top of `tracing`.
//!
//! The CLI picks the base level (`-v`/`-q`); everything else comes from the
//! environment:
//!
//! - `PREFORKD_LOG` / `RUST_LOG` - full filter directives, win over the level
//! - `PREFORKD_LOG_FORMAT` - `text`, `compact` or `json` (stderr output)
//! - `PREFORKD_LOG_FILE` - also append compact, ANSI-free logs to this file,
//!   rotated daily
//!
//! Workers inherit these variables from the supervisor, so the whole process
//! tree logs consistently to the supervisor's stderr and log file.

use std::path::Path;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Compact,
    Json,
}

fn parse_format(s: &str) -> Option<Format> {
    match s.to_ascii_lowercase().as_str() {
        "text" | "pretty" | "full" => Some(Format::Text),
        "compact" => Some(Format::Compact),
        "json" => Some(Format::Json),
        _ => None,
    }
}

/// Build the event filter: explicit directives from the environment if
/// present, otherwise `PREFORKD_LOG_LEVEL`, otherwise the level chosen on
/// the command line.
fn build_filter(default_level: Level) -> EnvFilter {
    let level = std::env::var("PREFORKD_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(default_level);

    let directives = std::env::var("PREFORKD_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok();
    match directives {
        Some(spec) => EnvFilter::try_new(&spec).unwrap_or_else(|_| {
            eprintln!("Warning: invalid log filter {:?}, using level instead", spec);
            EnvFilter::new(level.as_str().to_ascii_lowercase())
        }),
        None => EnvFilter::new(level.as_str().to_ascii_lowercase()),
    }
}

fn file_layer<S>(path: &Path) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let name = path.file_name().map(|n| n.to_os_string());
    let appender = RollingFileAppender::new(
        Rotation::DAILY,
        dir.unwrap_or_else(|| Path::new(".")),
        name.unwrap_or_else(|| "preforkd.log".into()),
    );
    fmt::layer()
        .compact()
        .with_ansi(false)
        .with_writer(appender)
        .boxed()
}

/// Install the global subscriber. Calling this more than once is a no-op, so
/// tests can initialize freely.
pub fn init(default_level: Level) {
    let format = std::env::var("PREFORKD_LOG_FORMAT")
        .ok()
        .and_then(|v| {
            let parsed = parse_format(&v);
            if parsed.is_none() {
                eprintln!("Warning: unknown log format {:?}, using text", v);
            }
            parsed
        })
        .unwrap_or(Format::Text);

    let stderr_layer = match format {
        Format::Text => fmt::layer().with_writer(std::io::stderr).boxed(),
        Format::Compact => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
        Format::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let to_file = std::env::var_os("PREFORKD_LOG_FILE")
        .map(|p| file_layer(Path::new(&p)));

    let _ = tracing_subscriber::registry()
        .with(build_filter(default_level))
        .with(stderr_layer)
        .with(to_file)
        .try_init();
}
