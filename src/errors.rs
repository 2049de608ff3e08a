//! Classified error taxonomy for the document-search core.
//!
//! Every fallible operation returns a [`ServiceError`]. The variant carries
//! the classification that drives retry and cleanup decisions: transient
//! upstream failures are retried with backoff, permanent ones fail the
//! owning document or request, and everything else maps onto a caller-facing
//! category. Control flow is never driven by unwinding.

use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the document-search core.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    /// Bad input shape, size, or content pattern. Not retried.
    #[error("validation failed: {0}")]
    #[diagnostic(
        code(docsmith::validation),
        help("Check input format, size limits, and blocked content patterns.")
    )]
    Validation(String),

    /// Tenant scope mismatch or disabled tenant. Not retried.
    #[error("forbidden: {0}")]
    #[diagnostic(code(docsmith::forbidden))]
    Forbidden(String),

    /// Entity missing. Not retried.
    #[error("not found: {what}")]
    #[diagnostic(code(docsmith::not_found))]
    NotFound { what: String },

    /// A rate-limit policy was exceeded. Callers map this to 429.
    #[error("rate limit exceeded for bucket '{bucket}'")]
    #[diagnostic(
        code(docsmith::rate_limited),
        help("Retry after the indicated interval.")
    )]
    RateLimited {
        bucket: &'static str,
        retry_after: Duration,
    },

    /// OCR/embedding/LLM/cache/metadata failure that is expected to clear.
    /// Retried with exponential backoff up to the configured limit.
    #[error("transient upstream failure in {stage}: {message}")]
    #[diagnostic(code(docsmith::transient_upstream))]
    TransientUpstream {
        stage: &'static str,
        message: String,
    },

    /// Upstream rejected the request outright (schema, format, dimension).
    /// Not retried.
    #[error("permanent upstream failure in {stage}: {message}")]
    #[diagnostic(code(docsmith::permanent_upstream))]
    PermanentUpstream {
        stage: &'static str,
        message: String,
    },

    /// Deadline elapsed or an explicit cancel was observed. Not retried.
    #[error("cancelled: {0}")]
    #[diagnostic(code(docsmith::cancelled))]
    Cancelled(String),

    /// The ingestion queue is at capacity.
    #[error("ingestion queue is full")]
    #[diagnostic(
        code(docsmith::queue_full),
        help("Back off and re-submit, or raise the queue capacity.")
    )]
    QueueFull,

    /// A bug. Fatal to the current request only; never retried.
    #[error("internal error: {0}")]
    #[diagnostic(code(docsmith::internal))]
    Internal(String),
}

impl ServiceError {
    /// Whether a retry with backoff is permitted for this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUpstream { .. })
    }

    /// Whether the error indicates an observed cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Short stable label recorded in document metadata and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::TransientUpstream { .. } => "transient_upstream",
            Self::PermanentUpstream { .. } => "permanent_upstream",
            Self::Cancelled(_) => "cancelled",
            Self::QueueFull => "queue_full",
            Self::Internal(_) => "internal",
        }
    }

    /// The retry-after hint for rate-limited errors.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Caller-facing message that never leaks raw upstream detail.
    ///
    /// Search/Answer surfaces pair this with the request's correlation id;
    /// the full message stays in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("validation failed: {msg}"),
            Self::Forbidden(_) => "forbidden".to_string(),
            Self::NotFound { what } => format!("not found: {what}"),
            Self::RateLimited { retry_after, .. } => {
                format!("rate limited; retry after {}s", retry_after.as_secs())
            }
            Self::QueueFull => "ingestion queue is full".to_string(),
            Self::Cancelled(_) => "request cancelled".to_string(),
            Self::TransientUpstream { .. } | Self::PermanentUpstream { .. } => {
                "upstream failure".to_string()
            }
            Self::Internal(_) => "internal error".to_string(),
        }
    }
}
