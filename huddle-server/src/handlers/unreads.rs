use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Query, State},
};
use serde::Deserialize;
use shared::models::{
    UnreadAcknowledgedResponse, UnreadCountsResponse, UnreadListResponse, normalize_path_like,
};
use utoipa::IntoParams;

use crate::{
    app_state::AppState,
    http::{error::AppResult, problem::ProblemDetails},
    middleware::request_context::RequestContext,
};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct PathLikeQuery {
    /// Path prefix with an optional trailing `%`, e.g. `chat-{groupId}%`.
    #[serde(default)]
    pub path_like: Option<String>,
}

impl PathLikeQuery {
    fn prefix(&self) -> AppResult<String> {
        Ok(normalize_path_like(self.path_like.as_deref().unwrap_or(""))?)
    }
}

#[utoipa::path(
    get,
    path = "/api/unreads",
    params(PathLikeQuery),
    responses(
        (status = 200, description = "Caller's unread markers under the prefix", body = UnreadListResponse),
        (status = 400, description = "Malformed pathLike", body = ProblemDetails),
        (status = 401, description = "No subject identity", body = ProblemDetails)
    ),
    tag = "Unreads"
)]
pub async fn list_unreads(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Query(query): Query<PathLikeQuery>,
) -> AppResult<Json<UnreadListResponse>> {
    let subject_id = context.require_subject()?;
    let prefix = query.prefix()?;
    let unreads = state
        .engine
        .propagator()
        .list_unreads(subject_id, &prefix)
        .await?;
    Ok(Json(UnreadListResponse { unreads }))
}

/// Read acknowledgement.
#[utoipa::path(
    delete,
    path = "/api/unreads",
    params(PathLikeQuery),
    responses(
        (status = 200, description = "Markers removed", body = UnreadAcknowledgedResponse),
        (status = 400, description = "Malformed pathLike", body = ProblemDetails),
        (status = 401, description = "No subject identity", body = ProblemDetails)
    ),
    tag = "Unreads"
)]
pub async fn acknowledge_unreads(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Query(query): Query<PathLikeQuery>,
) -> AppResult<Json<UnreadAcknowledgedResponse>> {
    let subject_id = context.require_subject()?;
    let prefix = query.prefix()?;
    let removed = state
        .engine
        .propagator()
        .acknowledge(subject_id, &prefix)
        .await?;
    Ok(Json(UnreadAcknowledgedResponse { removed }))
}

#[utoipa::path(
    get,
    path = "/api/unreads/counts",
    responses(
        (status = 200, description = "Unread messages per chat group", body = UnreadCountsResponse),
        (status = 401, description = "No subject identity", body = ProblemDetails)
    ),
    tag = "Unreads"
)]
pub async fn unread_counts(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<UnreadCountsResponse>> {
    let subject_id = context.require_subject()?;
    let groups = state.engine.propagator().unread_counts(subject_id).await?;
    Ok(Json(UnreadCountsResponse { groups }))
}
