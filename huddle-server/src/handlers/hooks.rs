use std::sync::Arc;

use axum::{Json, extract::State};
use shared::models::{
    MessageCreatedRequest, MessageCreatedResponse, MessageDeletedRequest, MessageDeletedResponse,
};

use crate::{
    app_state::AppState,
    http::{error::AppResult, problem::ProblemDetails},
};

/// Called by the CRUD layer once a message row is committed. Safe to repeat.
#[utoipa::path(
    post,
    path = "/api/hooks/messages/created",
    request_body = MessageCreatedRequest,
    responses(
        (status = 200, description = "Unread markers written", body = MessageCreatedResponse),
        (status = 404, description = "Unknown chat thread", body = ProblemDetails),
        (status = 503, description = "Storage unavailable after retries", body = ProblemDetails)
    ),
    tag = "Hooks"
)]
pub async fn message_created(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageCreatedRequest>,
) -> AppResult<Json<MessageCreatedResponse>> {
    let outcome = state
        .engine
        .propagator()
        .on_message_created(request.thread_id, request.message_id, request.author_id)
        .await?;
    Ok(Json(MessageCreatedResponse {
        path: outcome.path.into_string(),
        recipients: outcome.recipients,
    }))
}

#[utoipa::path(
    post,
    path = "/api/hooks/messages/deleted",
    request_body = MessageDeletedRequest,
    responses(
        (status = 200, description = "Unread markers removed", body = MessageDeletedResponse),
        (status = 404, description = "Unknown chat thread", body = ProblemDetails),
        (status = 503, description = "Storage unavailable after retries", body = ProblemDetails)
    ),
    tag = "Hooks"
)]
pub async fn message_deleted(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageDeletedRequest>,
) -> AppResult<Json<MessageDeletedResponse>> {
    let outcome = state
        .engine
        .propagator()
        .on_message_deleted(request.thread_id, request.message_id)
        .await?;
    Ok(Json(MessageDeletedResponse {
        path: outcome.path.into_string(),
        removed: outcome.removed,
    }))
}
