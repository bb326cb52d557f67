//! Tracing setup. State-transition and failure-point granularity only —
//! never a per-event hot-path log line.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber. Call once from `main`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .json()
        .init();
}
