//! Logging setup for the rproxy binary.
//!
//! Structured JSON logs to stdout. Every event emitted inside a session
//! carries that session's `id` and `peer` from the enclosing span.
//! `RUST_LOG`, when set, takes precedence over the configured level.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a subscriber has already been set.
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise rproxy tracing subscriber: {e}"))
}
