//! Error taxonomy shared across all agentmill crates.
//!
//! Every failure is classified into an [`ErrorKind`] that drives retry
//! decisions; classification is an explicit function of the error, never a
//! string match at the call site.

use std::time::Duration;

/// Shared error type used across all agentmill crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A conditional write lost its race (claim CAS, duplicate run, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A write would break a persistence invariant (seq gap, reopened
    /// terminal row, ...). Always a bug in the caller.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Transient I/O talking to the database. Retried internally by the
    /// store with capped backoff before it ever reaches a caller.
    #[error("transient io: {0}")]
    TransientIo(String),

    /// The model endpoint rejected or failed the request.
    #[error("model endpoint: {message}")]
    Model {
        /// HTTP status, when the failure carried one.
        status: Option<u16>,
        message: String,
        /// Server-provided back-off hint (Retry-After), when present.
        retry_after: Option<Duration>,
    },

    /// Input that can never succeed: schema violations, malformed model
    /// responses, unknown agents in a delegation list.
    #[error("{0}")]
    Permanent(String),

    /// The ownership predicate (`claimed_by = me AND status = expected`)
    /// failed: the row was rescued or cancelled out from under us.
    #[error("claim lost")]
    LostClaim,

    /// Caller-driven cancellation.
    #[error("cancelled")]
    Cancelled,

    /// A run reached a terminal failed state; carries the persisted kind.
    #[error("run failed ({kind:?}): {message}")]
    RunFailed { kind: ErrorKind, message: String },

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Retry-relevant classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Safe to retry immediately or with ordinary backoff.
    Transient,
    /// Retry only after an enforced back-off window.
    RateLimited,
    /// Retrying cannot help.
    Permanent,
    /// The row is no longer ours; abandon silently.
    LostClaim,
    /// Cancellation; propagate, never retry.
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransientIo(_) => ErrorKind::Transient,
            Error::Model { status, .. } => classify_model_status(*status),
            Error::LostClaim => ErrorKind::LostClaim,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::RunFailed { kind, .. } => *kind,
            Error::NotFound { .. }
            | Error::Conflict(_)
            | Error::InvariantViolation(_)
            | Error::Permanent(_)
            | Error::Json(_) => ErrorKind::Permanent,
        }
    }

    /// True when the caller may retry (possibly after a delay).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::RateLimited)
    }

    pub fn model(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Model {
            status,
            message: message.into(),
            retry_after: None,
        }
    }
}

/// Classify a model-endpoint HTTP status into an [`ErrorKind`].
///
/// 429 is rate-limited; 408 and the 5xx family are transient; every other
/// 4xx is permanent. A missing status means the transport itself failed,
/// which is transient.
pub fn classify_model_status(status: Option<u16>) -> ErrorKind {
    match status {
        None => ErrorKind::Transient,
        Some(429) => ErrorKind::RateLimited,
        Some(408) => ErrorKind::Transient,
        Some(s) if (500..=599).contains(&s) => ErrorKind::Transient,
        Some(s) if (400..=499).contains(&s) => ErrorKind::Permanent,
        Some(_) => ErrorKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_status_classification() {
        assert_eq!(classify_model_status(Some(429)), ErrorKind::RateLimited);
        assert_eq!(classify_model_status(Some(408)), ErrorKind::Transient);
        assert_eq!(classify_model_status(Some(500)), ErrorKind::Transient);
        assert_eq!(classify_model_status(Some(502)), ErrorKind::Transient);
        assert_eq!(classify_model_status(Some(503)), ErrorKind::Transient);
        assert_eq!(classify_model_status(Some(504)), ErrorKind::Transient);
        assert_eq!(classify_model_status(Some(400)), ErrorKind::Permanent);
        assert_eq!(classify_model_status(Some(404)), ErrorKind::Permanent);
        assert_eq!(classify_model_status(Some(422)), ErrorKind::Permanent);
        assert_eq!(classify_model_status(None), ErrorKind::Transient);
    }

    #[test]
    fn error_kind_mapping() {
        assert_eq!(
            Error::TransientIo("conn reset".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(Error::LostClaim.kind(), ErrorKind::LostClaim);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::Conflict("claim".into()).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(Error::model(Some(429), "slow down").kind(), ErrorKind::RateLimited);
        assert!(Error::model(Some(503), "overloaded").is_retryable());
        assert!(!Error::model(Some(400), "bad request").is_retryable());
    }
}
