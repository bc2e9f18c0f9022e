//! Tracing initialization.
//!
//! Log output goes to stderr so that the summary table on stdout stays clean. Verbosity is
//! controlled with `RUST_LOG`, defaulting to `volley=info`:
//!
//! ```bash
//! # Log every call
//! RUST_LOG=volley=debug volley -f volley.yaml
//! ```
//!
//! Per-call counters, the in-flight gauge and the latency histogram are emitted through the
//! `metrics` facade; they are no-ops unless the embedding application installs a recorder.

use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "volley=info";

/// Install the global subscriber: env filter plus a stderr fmt layer.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    debug!("Telemetry initialized");
    Ok(())
}
