use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use shared::models::PathError;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::{db::StoreError, services::EngineError};

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }
        problem.into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(message) => Self::service_unavailable(message),
            StoreError::Fatal(message) => Self::internal_server_error(message),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound { kind, id } => Self::not_found(format!("{kind} {id} not found"))
                .with_details(json!({ "resource": kind.to_string(), "id": id })),
            EngineError::Validation(message) => Self::bad_request(message),
            EngineError::Storage(store) => Self::from(store),
            EngineError::Membership(err) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "membership_unavailable",
                err.to_string(),
            ),
        }
    }
}

impl From<PathError> for ApiError {
    fn from(err: PathError) -> Self {
        Self::bad_request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::membership::MembershipError;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;
    use uuid::Uuid;

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::not_found("missing thread")
            .with_details(json!({ "resource": "chat thread" }))
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["type"], "https://huddle.dev/problems/not_found");
        assert_eq!(json["message"], "missing thread");
        assert_eq!(json["details"]["resource"], "chat thread");
    }

    #[test]
    fn engine_errors_map_to_status_codes() {
        let not_found = ApiError::from(EngineError::thread_not_found(Uuid::new_v4()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let invalid = ApiError::from(EngineError::Validation("bad scope".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let transient = ApiError::from(EngineError::Storage(StoreError::Transient("io".into())));
        assert_eq!(transient.status(), StatusCode::SERVICE_UNAVAILABLE);

        let fatal = ApiError::from(EngineError::Storage(StoreError::Fatal("decode".into())));
        assert_eq!(fatal.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let membership = ApiError::from(EngineError::Membership(MembershipError::Unavailable(
            "idp down".into(),
        )));
        assert_eq!(membership.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn malformed_path_like_is_a_bad_request() {
        let err = ApiError::from(PathError::WildcardPosition("chat-%x".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
