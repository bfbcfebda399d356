//! Error vocabulary for the analysis engine.
//!
//! Mirrors the teacher's error-boundary rule: no raw internal error text
//! ever crosses into a persisted event or SSE frame. [`AnalysisError`] is the
//! pattern-matchable type used everywhere inside the engine; [`Categorizable`]
//! sanitizes it (or any other error) down to a [`SafeErrorCategory`] plus a
//! short message safe to put in a card's `meta.code` / event payload.

use std::borrow::Cow;

use thiserror::Error;

/// Coarse category an error is sanitized down to before crossing a
/// persistence or client boundary. Matches the `error_kind` vocabulary in
/// the governing specification (§7), not Rust type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafeErrorCategory {
    InputInvalid,
    NotFound,
    UpstreamUnavailable,
    UpstreamRateLimited,
    Timeout,
    ValidationFailed,
    Cancelled,
    Internal,
}

impl SafeErrorCategory {
    /// Machine-readable `code` tag stored on a fallback card's `meta`.
    pub fn code(&self) -> &'static str {
        match self {
            SafeErrorCategory::InputInvalid => "input_invalid",
            SafeErrorCategory::NotFound => "not_found",
            SafeErrorCategory::UpstreamUnavailable => "upstream_unavailable",
            SafeErrorCategory::UpstreamRateLimited => "upstream_ratelimited",
            SafeErrorCategory::Timeout => "deadline",
            SafeErrorCategory::ValidationFailed => "validation_failed",
            SafeErrorCategory::Cancelled => "cancelled",
            SafeErrorCategory::Internal => "internal",
        }
    }

    /// Only these categories may legitimately carry caller-specific detail;
    /// everything else must degrade to a generic, sanitized message.
    pub fn may_carry_detail(&self) -> bool {
        matches!(self, SafeErrorCategory::InputInvalid | SafeErrorCategory::NotFound)
    }
}

/// Implemented by any error that knows how to sanitize itself for a
/// boundary crossing (event payload, API response, log line visible to a
/// client). Never call `.to_string()` on an arbitrary `anyhow::Error` and
/// hand it to a client directly — route it through this trait first.
pub trait Categorizable: std::error::Error {
    fn category(&self) -> SafeErrorCategory;

    /// A message safe to expose externally. Categories outside
    /// [`SafeErrorCategory::may_carry_detail`] must return a generic,
    /// non-leaky string regardless of the underlying cause.
    fn safe_message(&self) -> Cow<'static, str> {
        Cow::Borrowed(match self.category() {
            SafeErrorCategory::InputInvalid => "the request was invalid",
            SafeErrorCategory::NotFound => "subject could not be resolved",
            SafeErrorCategory::UpstreamUnavailable => "an upstream service was unavailable",
            SafeErrorCategory::UpstreamRateLimited => "an upstream service is rate-limiting requests",
            SafeErrorCategory::Timeout => "the operation exceeded its deadline",
            SafeErrorCategory::ValidationFailed => "the result failed validation",
            SafeErrorCategory::Cancelled => "the operation was cancelled",
            SafeErrorCategory::Internal => "an internal error occurred",
        })
    }
}

/// The engine's own error type. Every fallible operation in `analysis-core`
/// and its store/cache/log implementations should bottom out here (or wrap
/// one of these) before the error is allowed to influence a card or job
/// outcome.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("input invalid: {0}")]
    InputInvalid(String),

    #[error("subject not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {source_name}")]
    UpstreamUnavailable {
        source_name: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("upstream rate limited: {source_name}")]
    UpstreamRateLimited { source_name: String },

    #[error("card exceeded its deadline after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("conflict: idempotency key already bound to a different request")]
    Conflict,

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl Categorizable for AnalysisError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            AnalysisError::InputInvalid(_) => SafeErrorCategory::InputInvalid,
            AnalysisError::NotFound(_) => SafeErrorCategory::NotFound,
            AnalysisError::UpstreamUnavailable { .. } => SafeErrorCategory::UpstreamUnavailable,
            AnalysisError::UpstreamRateLimited { .. } => SafeErrorCategory::UpstreamRateLimited,
            AnalysisError::Timeout { .. } => SafeErrorCategory::Timeout,
            AnalysisError::ValidationFailed(_) => SafeErrorCategory::ValidationFailed,
            AnalysisError::Cancelled => SafeErrorCategory::Cancelled,
            AnalysisError::Conflict => SafeErrorCategory::InputInvalid,
            AnalysisError::Internal(_) => SafeErrorCategory::Internal,
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            AnalysisError::InputInvalid(detail) => Cow::Owned(detail.clone()),
            AnalysisError::NotFound(detail) => Cow::Owned(detail.clone()),
            AnalysisError::Conflict => {
                Cow::Borrowed("idempotency key already bound to a different request")
            }
            _ => Cow::Borrowed(match self.category() {
                SafeErrorCategory::UpstreamUnavailable => "an upstream service was unavailable",
                SafeErrorCategory::UpstreamRateLimited => {
                    "an upstream service is rate-limiting requests"
                }
                SafeErrorCategory::Timeout => "the operation exceeded its deadline",
                SafeErrorCategory::ValidationFailed => "the result failed validation",
                SafeErrorCategory::Cancelled => "the operation was cancelled",
                _ => "an internal error occurred",
            }),
        }
    }
}

/// Builds the `(code, safe_message)` pair stored on a fallback card's
/// `meta`, from any error. Never forwards `cause.to_string()` for
/// categories that may not carry detail.
pub fn sanitize(err: &AnalysisError) -> (&'static str, Cow<'static, str>) {
    (err.category().code(), err.safe_message())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_invalid_carries_detail() {
        let err = AnalysisError::InputInvalid("missing field: input.content".to_string());
        let (code, msg) = sanitize(&err);
        assert_eq!(code, "input_invalid");
        assert_eq!(msg, "missing field: input.content");
    }

    #[test]
    fn internal_errors_never_leak_cause_text() {
        let err = AnalysisError::Internal(anyhow::anyhow!("leaked secret connection string"));
        let (code, msg) = sanitize(&err);
        assert_eq!(code, "internal");
        assert!(!msg.contains("secret"));
    }

    #[test]
    fn upstream_unavailable_is_generic() {
        let err = AnalysisError::UpstreamUnavailable {
            source_name: "scholar-api".to_string(),
            cause: anyhow::anyhow!("connection reset by peer at 10.0.0.1"),
        };
        let (code, msg) = sanitize(&err);
        assert_eq!(code, "upstream_unavailable");
        assert!(!msg.contains("10.0.0.1"));
    }
}
