//! Tracing setup for the CLI.
//!
//! Logs go to stderr, filtered by `CONDUCTOR_LOG` (falling back to `warn`).
//! Set `CONDUCTOR_LOG_FORMAT=json` for line-delimited JSON, e.g. when the
//! monitor daemon runs under a supervisor that ships logs.

use tracing_subscriber::EnvFilter;

/// Guard returned by `init`; keep it alive for the process lifetime.
pub struct Telemetry;

/// Install the global subscriber. Safe to call once per process.
pub fn init() -> Telemetry {
    let filter = EnvFilter::try_from_env("CONDUCTOR_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let json = std::env::var("CONDUCTOR_LOG_FORMAT").is_ok_and(|v| v == "json");
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Telemetry
}
