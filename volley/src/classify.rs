//! Failure classification.
//!
//! Invokers report what went wrong as a [`CallFailure`]; [`classify`] turns it
//! into one of the closed [`ErrorKind`]s. The mapping is total and depends only
//! on the failure's category, never on timing or on previous calls.

use std::time::Duration;

use thiserror::Error;

use crate::types::ErrorKind;

/// An unclassified per-call failure as observed by an invoker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    /// The transport gave up waiting, or the dispatcher's per-call deadline elapsed
    #[error("request timed out: {message}")]
    Timeout { message: String },

    /// The remote service answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        /// Provider-specific error code (e.g. `ThrottlingException`, `invalid_request_error`)
        code: Option<String>,
        message: String,
    },

    /// Connection, TLS or protocol failure before a status was received
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A success status with a body we could not interpret
    #[error("malformed response: {message}")]
    Decode { message: String },

    /// The invoker panicked while handling the call
    #[error("invoker panicked: {message}")]
    Panicked { message: String },
}

impl CallFailure {
    pub fn deadline_exceeded(deadline: Duration) -> Self {
        CallFailure::Timeout {
            message: format!("no response within {}", humantime::format_duration(deadline)),
        }
    }
}

/// Map a failure to its error kind.
pub fn classify(failure: &CallFailure) -> ErrorKind {
    match failure {
        CallFailure::Timeout { .. } => ErrorKind::Timeout,
        CallFailure::Status { status, code, .. } => classify_status(*status, code.as_deref()),
        CallFailure::Transport { .. } | CallFailure::Decode { .. } | CallFailure::Panicked { .. } => ErrorKind::Unknown,
    }
}

fn classify_status(status: u16, code: Option<&str>) -> ErrorKind {
    match status {
        408 | 504 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimit,
        401 | 403 => ErrorKind::Authentication,
        400..=499 => code.and_then(classify_code).unwrap_or(ErrorKind::Validation),
        500..=599 => match code.and_then(classify_code) {
            Some(kind @ (ErrorKind::Timeout | ErrorKind::RateLimit)) => kind,
            _ => ErrorKind::ServiceUnavailable,
        },
        _ => code.and_then(classify_code).unwrap_or(ErrorKind::Unknown),
    }
}

/// Provider error codes, matched case-insensitively by substring.
fn classify_code(code: &str) -> Option<ErrorKind> {
    let code = code.to_ascii_lowercase();
    let has = |needle: &str| code.contains(needle);

    if has("throttl") || has("toomanyrequests") || has("rate_limit") {
        Some(ErrorKind::RateLimit)
    } else if has("timeout") {
        Some(ErrorKind::Timeout)
    } else if has("accessdenied") || has("unauthorized") || has("authentication") || has("permission") {
        Some(ErrorKind::Authentication)
    } else if has("serviceunavailable") || has("server_error") || has("internal") {
        Some(ErrorKind::ServiceUnavailable)
    } else if has("validation") || has("invalid_request") {
        Some(ErrorKind::Validation)
    } else {
        None
    }
}
