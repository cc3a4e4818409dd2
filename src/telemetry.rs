//! Telemetry initialization.
//!
//! Structured logging to stderr via tracing-subscriber, filtered by
//! `RUST_LOG` (default `warn`). `BEADS_LOG_FORMAT=json` switches to JSON
//! lines for machine consumers; anything else gets the compact human
//! format.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Call once from `main`; a second call
/// is a no-op because the global default is already set.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let json = std::env::var("BEADS_LOG_FORMAT").is_ok_and(|v| v == "json");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    // Already-initialized is fine (tests init repeatedly).
    drop(result);
}
