//! Inbound answer surface
//!
//! Request and response shapes for submitting an answer to a pending
//! question, with the status mapping an HTTP or IPC front-end returns.

use crate::broker::{AnswerRecord, QuestionId};
use crate::{ErrorKind, OrchestratorError, Result};
use serde::{Deserialize, Serialize};

/// Answer submitted by a human
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAnswerRequest {
    pub question_id: QuestionId,
    pub answer: String,
}

impl SubmitAnswerRequest {
    pub fn new(question_id: impl Into<QuestionId>, answer: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            answer: answer.into(),
        }
    }
}

/// Result of an answer submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAnswerResponse {
    pub success: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmitAnswerResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            status: 200,
            code: None,
            error: None,
        }
    }

    pub fn from_error(err: &OrchestratorError) -> Self {
        Self {
            success: false,
            status: status_code(err),
            code: Some(error_code(err).to_string()),
            error: Some(err.to_string()),
        }
    }
}

impl From<Result<AnswerRecord>> for SubmitAnswerResponse {
    fn from(result: Result<AnswerRecord>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(err) => Self::from_error(&err),
        }
    }
}

/// HTTP status code for an error
pub fn status_code(err: &OrchestratorError) -> u16 {
    match err.kind() {
        ErrorKind::NotFound => 404,
        ErrorKind::Conflict => 409,
        ErrorKind::Validation => 422,
        ErrorKind::Timeout => 408,
        ErrorKind::Cancelled => 410,
        ErrorKind::Execution | ErrorKind::Internal => 500,
    }
}

/// Error code identifier for programmatic handling
pub fn error_code(err: &OrchestratorError) -> &'static str {
    match err.kind() {
        ErrorKind::NotFound => "NOT_FOUND",
        ErrorKind::Conflict => "CONFLICT",
        ErrorKind::Validation => "VALIDATION_ERROR",
        ErrorKind::Timeout => "TIMEOUT",
        ErrorKind::Cancelled => "CANCELLED",
        ErrorKind::Execution => "EXECUTION_ERROR",
        ErrorKind::Internal => "INTERNAL_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (OrchestratorError::QuestionNotFound("q".into()), 404, "NOT_FOUND"),
            (OrchestratorError::Conflict("q".into()), 409, "CONFLICT"),
            (OrchestratorError::Validation("empty".into()), 422, "VALIDATION_ERROR"),
            (OrchestratorError::Config("bad".into()), 500, "INTERNAL_ERROR"),
        ];
        for (err, status, code) in cases {
            let response = SubmitAnswerResponse::from_error(&err);
            assert!(!response.success);
            assert_eq!(response.status, status);
            assert_eq!(response.code.as_deref(), Some(code));
        }
    }

    #[test]
    fn test_ok_response_serializes_without_error() {
        let json = serde_json::to_value(SubmitAnswerResponse::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "status": 200}));
    }

    #[test]
    fn test_request_deserializes() {
        let request: SubmitAnswerRequest =
            serde_json::from_str(r#"{"question_id":"q-1","answer":"blue"}"#).unwrap();
        assert_eq!(request, SubmitAnswerRequest::new("q-1", "blue"));
    }
}
