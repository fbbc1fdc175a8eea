//! Error types for bucket lifecycle and admission
use std::time::Duration;

use thiserror::Error;

/// Failures reported by the per-key operations.
///
/// Quota exhaustion is not an error: it is reported as
/// [`Decision::Denied`](crate::Decision::Denied).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// `create` was called for a key that already has a live bucket.
    #[error("bucket '{key}' already exists")]
    AlreadyExists { key: String },
    /// The key has no live bucket (never created, idled out, stopped or faulted).
    #[error("no live bucket for key '{key}'")]
    InvalidKey { key: String },
}

impl QuotaError {
    pub(crate) fn invalid_key(key: &str) -> Self {
        Self::InvalidKey { key: key.to_string() }
    }

    /// Check if this error reports a missing bucket
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }

    /// Check if this error reports a duplicate creation
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Key the error refers to.
    pub fn key(&self) -> &str {
        match self {
            Self::AlreadyExists { key } | Self::InvalidKey { key } => key,
        }
    }
}

/// Internal invariant violation inside a bucket's processing step.
///
/// A fault terminates the offending bucket abnormally; it never reaches callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum BucketFault {
    #[error("quota overrun: used {used} exceeds max {max}")]
    QuotaOverrun { used: u32, max: u32 },
}

/// Error returned by [`QuotaService`](crate::middleware::QuotaService).
#[derive(Debug, Clone, Error)]
pub enum LimitError<E> {
    /// The key's quota is exhausted for the current window.
    #[error("rate limited; retry after {retry_after:?}")]
    Denied { retry_after: Duration },
    /// The key's bucket could not be reached.
    #[error("quota bucket unavailable: {0}")]
    Unavailable(QuotaError),
    /// The inner service failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> LimitError<E> {
    /// Check if this error is a quota denial
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    /// Backoff hint if this is a denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Denied { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
