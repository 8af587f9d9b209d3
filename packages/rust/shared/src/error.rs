//! Error types for tastebase.
//!
//! Library crates use [`TastebaseError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Substrings that mark an error message as a transient external failure.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "connection refused",
    "rate limit",
    "rate-limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

/// Top-level error type for all tastebase operations.
#[derive(Debug, thiserror::Error)]
pub enum TastebaseError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Input rejected before any cost was incurred.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Transport-level failure talking to an external service.
    #[error("network error: {0}")]
    Network(String),

    /// The external call gateway answered with a non-success status.
    #[error("gateway error (status {status:?}): {message}")]
    Gateway { status: Option<u16>, message: String },

    /// The external call gateway throttled us.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// An external call or a whole run exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A model response could not be parsed into the expected shape.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A dedup gate or uniqueness constraint blocked a write.
    #[error("persistence conflict on {table}: {message}")]
    PersistenceConflict { table: String, message: String },

    /// The worst-case cost estimate exceeds the configured ceiling.
    #[error("budget exceeded: worst case ${max_usd:.4} > ceiling ${ceiling_usd:.4}")]
    BudgetExceeded { max_usd: f64, ceiling_usd: f64 },

    /// A fatal step failed and aborted the run.
    #[error("step `{step}` failed: {message}")]
    StepFatal { step: String, message: String },

    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TastebaseError>;

impl TastebaseError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a persistence conflict for `table`.
    pub fn conflict(table: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PersistenceConflict {
            table: table.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code, used in run error records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Validation { .. } => "validation",
            Self::Network(_) => "network",
            Self::Gateway { .. } => "gateway",
            Self::RateLimited(_) => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::Parse { .. } => "parse",
            Self::Storage(_) => "storage",
            Self::PersistenceConflict { .. } => "persistence_conflict",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::StepFatal { .. } => "step_failed",
            Self::NotFound { .. } => "not_found",
            Self::Io { .. } => "io",
        }
    }

    /// Whether this error is worth retrying with backoff.
    ///
    /// Typed variants decide first; anything else falls back to the
    /// message signature match in [`is_transient_message`].
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::Timeout(_) => true,
            Self::Gateway {
                status: Some(status),
                ..
            } => matches!(status, 429 | 502 | 503 | 504),
            Self::Network(msg) => is_transient_message(msg),
            Self::Gateway { status: None, message } => is_transient_message(message),
            _ => false,
        }
    }
}

/// Default transient-failure predicate over an error's text.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}
