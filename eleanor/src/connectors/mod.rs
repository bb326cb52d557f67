//! Connector capability framework: pulls raw records from an external
//! source (a directory of log files, a polled API, a streaming socket) and
//! hands them to a parser. Connectors expose a small state machine and
//! monotonic per-connector metrics so the processor and operators can
//! observe health without reaching into implementation details.

pub mod file_polling;
pub mod tcp_stream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};

use crate::core::RawEvent;
use crate::err::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Paused,
}

#[derive(Debug, Default)]
pub struct ConnectorMetrics {
    pub records_read: AtomicU64,
    pub records_excluded: AtomicU64,
    pub errors: AtomicU64,
    pub bytes_read: AtomicU64,
}

impl ConnectorMetrics {
    pub fn snapshot(&self) -> ConnectorMetricsSnapshot {
        ConnectorMetricsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            records_excluded: self.records_excluded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ConnectorMetricsSnapshot {
    pub records_read: u64,
    pub records_excluded: u64,
    pub errors: u64,
    pub bytes_read: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorConfig {
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
}

/// Exclude-then-include precedence: a path excluded by `exclude_globs` is
/// dropped even if it also matches `include_globs`; an empty
/// `include_globs` means "include everything not excluded".
pub fn should_include(config: &ConnectorConfig, path: &str) -> bool {
    let build = |patterns: &[String]| -> Option<globset::GlobSet> {
        if patterns.is_empty() {
            return None;
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            }
        }
        builder.build().ok()
    };

    if let Some(excludes) = build(&config.exclude_globs) {
        if excludes.is_match(path) {
            return false;
        }
    }
    match build(&config.include_globs) {
        Some(includes) => includes.is_match(path),
        None => true,
    }
}

/// A source of raw records. Implementations are either polling (check for
/// new data on an interval) or streaming (push-driven, e.g. a socket or
/// subscription).
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> ConnectorState;
    fn metrics(&self) -> Arc<ConnectorMetrics>;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// A connector that actively checks its source on an interval rather than
/// receiving a push.
#[async_trait]
pub trait PollingConnector: Connector {
    async fn poll_once(&self) -> Result<Vec<RawEvent>>;
}

/// A connector that receives records continuously for as long as it's
/// running; events are delivered through an internal channel rather than
/// returned from a single call.
#[async_trait]
pub trait StreamingConnector: Connector {
    async fn next_batch(&self) -> Result<Vec<RawEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_wins_over_include() {
        let config = ConnectorConfig {
            include_globs: vec!["**/*.log".to_string()],
            exclude_globs: vec!["**/debug/*.log".to_string()],
        };
        assert!(should_include(&config, "var/log/app.log"));
        assert!(!should_include(&config, "var/log/debug/app.log"));
    }

    #[test]
    fn empty_include_means_everything() {
        let config = ConnectorConfig {
            include_globs: vec![],
            exclude_globs: vec!["**/*.tmp".to_string()],
        };
        assert!(should_include(&config, "anything.log"));
        assert!(!should_include(&config, "anything.tmp"));
    }
}
