//! HTTP error mapping: library errors to status codes and a FHIR
//! `OperationOutcome` body.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use octofhir_storage::{ErrorCategory, StorageError};
use octofhir_subscriptions::SubscriptionError;
use octofhir_terminology::TerminologyError;
use serde::Serialize;
use thiserror::Error;

/// Minimal FHIR OperationOutcome for error responses.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationOutcome {
    #[serde(rename = "resourceType")]
    pub resource_type: &'static str,
    pub issue: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationOutcomeIssue {
    /// fatal | error | warning | information
    pub severity: &'static str,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl OperationOutcome {
    pub fn single(
        severity: &'static str,
        code: &'static str,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: "OperationOutcome",
            issue: vec![OperationOutcomeIssue {
                severity,
                code,
                diagnostics: Some(diagnostics.into()),
            }],
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    /// A remote authority could not be reached or answered with an error.
    #[error("Bad gateway: {0}")]
    BadGateway(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_operation_outcome(&self) -> OperationOutcome {
        match self {
            ApiError::BadRequest(msg) => OperationOutcome::single("error", "invalid", msg),
            ApiError::NotFound(msg) => OperationOutcome::single("error", "not-found", msg),
            ApiError::Conflict(msg) => OperationOutcome::single("error", "conflict", msg),
            ApiError::BadGateway(msg) => OperationOutcome::single("error", "transient", msg),
            ApiError::Internal(msg) => OperationOutcome::single("fatal", "exception", msg),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e.category() {
            ErrorCategory::NotFound => ApiError::NotFound(e.to_string()),
            ErrorCategory::Conflict => ApiError::Conflict(e.to_string()),
            ErrorCategory::Validation => ApiError::BadRequest(e.to_string()),
            ErrorCategory::Internal => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        match e {
            SubscriptionError::Validation(_) | SubscriptionError::NotBindable(_) => {
                ApiError::BadRequest(e.to_string())
            }
            SubscriptionError::TopicNotFound(_) | SubscriptionError::SubscriptionNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            SubscriptionError::ConcurrencyConflict { .. }
            | SubscriptionError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            SubscriptionError::Storage(inner) => inner.into(),
            SubscriptionError::TransientDelivery(_) | SubscriptionError::PermanentDelivery(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<TerminologyError> for ApiError {
    fn from(e: TerminologyError) -> Self {
        match e {
            TerminologyError::InvalidRequest(_) => ApiError::BadRequest(e.to_string()),
            TerminologyError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            TerminologyError::UpstreamUnavailable { .. } | TerminologyError::Remote { .. } => {
                ApiError::BadGateway(e.to_string())
            }
            TerminologyError::Storage(inner) => inner.into(),
            TerminologyError::Config(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::to_vec(&self.to_operation_outcome()).unwrap_or_else(|_| b"{}".to_vec());
        (
            status,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/fhir+json"),
            )],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_subscriptions::SubscriptionStatus;

    #[test]
    fn into_response_sets_status_and_content_type() {
        let resp = ApiError::bad_request("Invalid parameter").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            &HeaderValue::from_static("application/fhir+json")
        );
    }

    #[test]
    fn library_errors_map_to_status_codes() {
        let cases: Vec<(ApiError, StatusCode, &str)> = vec![
            (
                StorageError::not_found("Patient", "1").into(),
                StatusCode::NOT_FOUND,
                "not-found",
            ),
            (
                StorageError::version_conflict("1", "2").into(),
                StatusCode::CONFLICT,
                "conflict",
            ),
            (
                SubscriptionError::InvalidTransition {
                    from: SubscriptionStatus::Off,
                    to: SubscriptionStatus::Active,
                }
                .into(),
                StatusCode::CONFLICT,
                "conflict",
            ),
            (
                SubscriptionError::validation("bad").into(),
                StatusCode::BAD_REQUEST,
                "invalid",
            ),
            (
                TerminologyError::UpstreamUnavailable {
                    url: "http://tx".into(),
                    message: "refused".into(),
                }
                .into(),
                StatusCode::BAD_GATEWAY,
                "transient",
            ),
            (
                TerminologyError::code_system_not_found("http://x").into(),
                StatusCode::NOT_FOUND,
                "not-found",
            ),
            (
                TerminologyError::invalid_request("code is required").into(),
                StatusCode::BAD_REQUEST,
                "invalid",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_code(), status);
            assert_eq!(err.to_operation_outcome().issue[0].code, code);
        }
    }
}
