//! Error types for the configuration and orchestration layers.
//!
//! The per-frame tracking path has no error type on purpose: every numerical
//! anomaly there degrades to a defined fallback. Errors only exist where a caller
//! hands us something we cannot build from.

use thiserror::Error;

/// The code catalogue could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogueError {
    #[error("catalogue contains no codes")]
    Empty,
    #[error("code {index} is empty")]
    EmptyCode { index: usize },
    #[error("code {index} has {got} bits, expected {expected} (all codes must have equal length)")]
    LengthMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
    #[error("code {index} contains symbol {symbol}, only 0 and 1 are allowed")]
    InvalidSymbol { index: usize, symbol: u8 },
}

/// Pipeline configuration is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// The multi-stream pool could not serve a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no stream with index {0}")]
    UnknownStream(usize),
    #[error("worker for stream `{0}` has shut down")]
    WorkerGone(String),
}
