//! Core types shared by the dispatcher, the invokers and the aggregator.
//!
//! Work items are built once by the driver and never mutated. Call records are
//! created by the dispatcher from an [`Invocation`](crate::invoker::Invocation)
//! and are read-only afterwards; the constructors enforce that a record carries
//! response text exactly when it succeeded and an error kind exactly when it
//! did not.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::errors::{Error, Result};

/// 1-based position of a call within its work item, assigned at issuance.
pub type CallId = u32;

/// Parameters for the remote model, as sent with every call of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Display name; also the pricing lookup key
    pub name: String,
    /// Identifier the remote API expects in the request body
    pub model_id: String,
    /// Upper bound on generated tokens
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// One (model, prompt, call count) unit of benchmarking work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub model: ModelParams,
    pub prompt: String,
    pub prompt_label: String,
    pub call_count: u32,
}

impl WorkItem {
    pub fn new(model: ModelParams, prompt: impl Into<String>, prompt_label: impl Into<String>, call_count: u32) -> Self {
        Self {
            model,
            prompt: prompt.into(),
            prompt_label: prompt_label.into(),
            call_count,
        }
    }

    /// Checks the invariants the invoker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.call_count == 0 {
            return Err(Error::configuration(format!(
                "call count for model '{}' / prompt '{}' must be at least 1",
                self.model.name, self.prompt_label
            )));
        }
        if self.prompt.trim().is_empty() {
            return Err(Error::configuration(format!("prompt '{}' is empty", self.prompt_label)));
        }
        if self.model.max_tokens == 0 {
            return Err(Error::configuration(format!("max_tokens for model '{}' must be positive", self.model.name)));
        }
        Ok(())
    }
}

/// Closed classification of why a call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    ServiceUnavailable,
    Authentication,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::ServiceUnavailable,
        ErrorKind::Authentication,
        ErrorKind::Validation,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single request to the remote generation service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    call_id: CallId,
    success: bool,
    #[serde(serialize_with = "serialize_secs")]
    response_time: Duration,
    input_tokens: u64,
    output_tokens: u64,
    #[serde(rename = "response")]
    response_text: Option<String>,
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl CallRecord {
    pub fn succeeded(call_id: CallId, response_time: Duration, input_tokens: u64, output_tokens: u64, response_text: String) -> Self {
        Self {
            call_id,
            success: true,
            response_time,
            input_tokens,
            output_tokens,
            response_text: Some(response_text),
            error_kind: None,
            error_message: None,
        }
    }

    pub fn failed(
        call_id: CallId,
        response_time: Duration,
        input_tokens: u64,
        output_tokens: u64,
        error_kind: ErrorKind,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            call_id,
            success: false,
            response_time,
            input_tokens,
            output_tokens,
            response_text: None,
            error_kind: Some(error_kind),
            error_message: Some(error_message.into()),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn response_time(&self) -> Duration {
        self.response_time
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn response_text(&self) -> Option<&str> {
        self.response_text.as_deref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Label used for metrics and logs: "success" or the error kind.
    pub fn outcome_label(&self) -> &'static str {
        self.error_kind.map(|kind| kind.as_str()).unwrap_or("success")
    }
}

pub(crate) fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelParams {
        ModelParams {
            name: "M".to_string(),
            model_id: "m-1".to_string(),
            max_tokens: 256,
            temperature: 0.7,
            top_p: None,
        }
    }

    #[test]
    fn test_work_item_validation() {
        assert!(WorkItem::new(model(), "hello", "greeting", 3).validate().is_ok());

        let err = WorkItem::new(model(), "hello", "greeting", 0).validate().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        let err = WorkItem::new(model(), "   ", "blank", 1).validate().unwrap_err();
        assert!(err.to_string().contains("blank"));

        let mut params = model();
        params.max_tokens = 0;
        assert!(WorkItem::new(params, "hello", "greeting", 1).validate().is_err());
    }

    #[test]
    fn test_record_constructors_keep_outcome_fields_exclusive() {
        let ok = CallRecord::succeeded(1, Duration::from_millis(150), 10, 20, "hi".to_string());
        assert!(ok.is_success());
        assert_eq!(ok.response_text(), Some("hi"));
        assert_eq!(ok.error_kind(), None);
        assert_eq!(ok.outcome_label(), "success");

        let failed = CallRecord::failed(2, Duration::from_millis(80), 0, 0, ErrorKind::RateLimit, "HTTP 429");
        assert!(!failed.is_success());
        assert_eq!(failed.response_text(), None);
        assert_eq!(failed.error_kind(), Some(ErrorKind::RateLimit));
        assert_eq!(failed.outcome_label(), "rate_limit");
    }

    #[test]
    fn test_record_serializes_response_time_in_seconds() {
        let record = CallRecord::failed(4, Duration::from_millis(1500), 3, 0, ErrorKind::Timeout, "deadline");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["call_id"], 4);
        assert_eq!(json["success"], false);
        assert_eq!(json["response_time"], 1.5);
        assert_eq!(json["response"], serde_json::Value::Null);
        assert_eq!(json["error_kind"], "timeout");
        assert_eq!(json["error_message"], "deadline");
    }
}
