//! Error taxonomy for the Eleanor core.
//!
//! One variant per named error kind, `#[from]` conversions for the library
//! errors the core actually wraps, and a set of helper constructors for
//! building each variant without naming its fields at every call site.

use std::fmt;

pub type Result<T> = std::result::Result<T, EleanorError>;

#[derive(Debug, thiserror::Error)]
pub enum EleanorError {
    /// A single bad record inside an otherwise-fine stream. Logged with
    /// source+line, counted, and skipped — never propagated past the
    /// parser that produced it.
    #[error("malformed record in {source}:{line}: {reason}")]
    MalformedRecord {
        source: String,
        line: u64,
        reason: String,
    },

    /// The whole input is unrecognizable as the claimed format.
    #[error("malformed source {source}: {reason}")]
    MalformedSource { source: String, reason: String },

    /// I/O or external service failure; caller should retry with backoff.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// Auth/authorization failure or a non-retryable 4xx-equivalent.
    #[error("permanent upstream failure: {0}")]
    PermanentUpstream(String),

    /// Sigma or correlation rule failed to parse or evaluate.
    #[error("rule error in {rule_id}: {reason}")]
    RuleError { rule_id: String, reason: String },

    /// Evidence hash mismatch on verify.
    #[error("integrity failure for evidence {evidence_id}: expected {expected}, got {actual}")]
    IntegrityFailure {
        evidence_id: String,
        expected: String,
        actual: String,
    },

    /// An operation was requested against an execution/approval/evidence
    /// object that is not in a state that permits it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A workflow or approval expired before completion.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl EleanorError {
    pub fn malformed_record(source: impl Into<String>, line: u64, reason: impl fmt::Display) -> Self {
        Self::MalformedRecord {
            source: source.into(),
            line,
            reason: reason.to_string(),
        }
    }

    pub fn malformed_source(source: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::MalformedSource {
            source: source.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transient(reason: impl fmt::Display) -> Self {
        Self::TransientUpstream(reason.to_string())
    }

    pub fn permanent(reason: impl fmt::Display) -> Self {
        Self::PermanentUpstream(reason.to_string())
    }

    pub fn rule(rule_id: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::RuleError {
            rule_id: rule_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn integrity(evidence_id: impl Into<String>, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::IntegrityFailure {
            evidence_id: evidence_id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_state(reason: impl fmt::Display) -> Self {
        Self::InvalidState(reason.to_string())
    }

    pub fn timeout(reason: impl fmt::Display) -> Self {
        Self::Timeout(reason.to_string())
    }

    pub fn config(reason: impl fmt::Display) -> Self {
        Self::Config(reason.to_string())
    }

    /// Whether this error kind should be retried by a caller with backoff,
    /// per spec §7 policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientUpstream(_) | Self::Redis(_) | Self::Io(_))
    }
}
