use std::str::FromStr;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use shared::config::server::Config;
use tracing::debug;
use uuid::Uuid;

use crate::http::error::{ApiError, AppResult};

/// Per-request data attached by [`assign_request_id`].
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    /// Subject asserted by the upstream gateway, if any.
    pub subject: Option<Uuid>,
}

impl RequestContext {
    /// The calling subject, or 401 when the gateway did not supply one.
    pub fn require_subject(&self) -> AppResult<Uuid> {
        self.subject
            .ok_or_else(|| ApiError::unauthorized("request carries no subject identity"))
    }
}

#[derive(Clone, Debug)]
pub struct RequestIdState {
    request_id_header: HeaderName,
    subject_header: HeaderName,
}

impl RequestIdState {
    pub fn from_config(config: &Config) -> Self {
        let request_id_header = HeaderName::from_str(&config.server.request_id_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-request-id"));
        let subject_header = HeaderName::from_str(&config.server.subject_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-subject-id"));
        Self {
            request_id_header,
            subject_header,
        }
    }
}

pub async fn assign_request_id(
    State(state): State<RequestIdState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let request_id = header_text(request.headers(), &state.request_id_header)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let subject = match header_text(request.headers(), &state.subject_header) {
        Some(raw) => Some(
            Uuid::parse_str(&raw)
                .map_err(|_| ApiError::unauthorized("subject header is not a valid id"))?,
        ),
        None => None,
    };
    debug!(request_id = %request_id, subject = ?subject, "request context assigned");

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        subject,
    });

    let header_value = HeaderValue::from_str(&request_id)
        .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?;
    request
        .headers_mut()
        .insert(state.request_id_header.clone(), header_value.clone());

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(state.request_id_header, header_value);

    Ok(response)
}

fn header_text(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, http::StatusCode, routing::get};
    use tower::ServiceExt;

    async fn echo(Extension(context): Extension<RequestContext>) -> String {
        context
            .subject
            .map_or_else(|| "anonymous".to_string(), |id| id.to_string())
    }

    fn app() -> Router {
        let state = RequestIdState::from_config(&Config::default());
        Router::new()
            .route("/", get(echo))
            .layer(axum::middleware::from_fn_with_state(state, assign_request_id))
    }

    #[tokio::test]
    async fn generates_request_id_when_missing() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers().get("x-request-id").unwrap();
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn echoes_caller_request_id_and_parses_subject() {
        let subject = Uuid::new_v4();
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-request-id", "abc-123")
                    .header("x-subject-id", subject.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-request-id").unwrap(), "abc-123");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body, subject.to_string().as_bytes());
    }

    #[tokio::test]
    async fn malformed_subject_is_unauthorized() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-subject-id", "not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn require_subject_without_header_is_unauthorized() {
        let err = RequestContext::default().require_subject().unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
