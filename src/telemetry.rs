//! Logging for the sidecar process
//!
//! Stdout belongs to the handshake, so every log line goes to stderr.
//! `RUST_LOG` overrides the default filter, which keeps the sidecar's own
//! events at info and quiets the kube client stack.
//!
//! # Example
//!
//! ```no_run
//! use it_sidecar::telemetry::init_logging;
//!
//! init_logging();
//! ```

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "info,kube=warn,tower=warn,hyper=warn";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the stderr subscriber; later calls are no-ops
pub fn init_logging() {
    let stderr_is_tty = std::io::stderr().is_terminal();
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(stderr_is_tty),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
