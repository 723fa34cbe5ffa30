use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`ChainAdapter`](super::ChainAdapter).
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// Node unreachable, connection dropped, rate limited or returned a
    /// transport-level error.
    #[error("endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    /// The node refused the span of a log query.
    #[error("node rejected log range {from}..={to}: {message}")]
    RangeTooLarge { from: u64, to: u64, message: String },

    #[error("block {0} not found")]
    BlockNotFound(u64),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

impl ChainError {
    /// Transient errors are retried with backoff by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EndpointUnavailable(_) | Self::Timeout(..))
    }
}
