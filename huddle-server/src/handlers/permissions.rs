//! Grant administration and scope queries.
//!
//! Grant writes are service-to-service calls from the CRUD layer and carry no
//! subject check; scope queries answer for the calling subject.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use shared::models::{
    AudienceResponse, GrantScopeRequest, GroupPermissionGrant, ResolvedScopeResponse,
    ThreadGroupPermissionGrant, ThreadUserPermissionGrant,
};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::{
        error::{ApiError, AppResult},
        problem::ProblemDetails,
    },
    middleware::request_context::RequestContext,
};

fn grant_not_found() -> ApiError {
    ApiError::not_found("grant not found")
}

#[utoipa::path(
    get,
    path = "/api/chat-groups/{group_id}/permissions",
    params(("group_id" = Uuid, Path, description = "Chat group id")),
    responses(
        (status = 200, description = "Grants on the chat group", body = [GroupPermissionGrant]),
        (status = 404, description = "Unknown chat group", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn list_group_permissions(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<Uuid>,
) -> AppResult<Json<Vec<GroupPermissionGrant>>> {
    Ok(Json(state.engine.grants().group_grants(group_id).await?))
}

#[utoipa::path(
    put,
    path = "/api/chat-groups/{group_id}/permissions/{user_group_id}",
    params(
        ("group_id" = Uuid, Path, description = "Chat group id"),
        ("user_group_id" = Uuid, Path, description = "User group id")
    ),
    request_body = GrantScopeRequest,
    responses(
        (status = 200, description = "Grant stored", body = GroupPermissionGrant),
        (status = 404, description = "Unknown chat group", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn put_group_permission(
    State(state): State<Arc<AppState>>,
    Path((group_id, user_group_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<GrantScopeRequest>,
) -> AppResult<Json<GroupPermissionGrant>> {
    let grant = state
        .engine
        .grants()
        .put_group_grant(group_id, user_group_id, request.scope)
        .await?;
    Ok(Json(grant))
}

#[utoipa::path(
    delete,
    path = "/api/chat-groups/{group_id}/permissions/{user_group_id}",
    params(
        ("group_id" = Uuid, Path, description = "Chat group id"),
        ("user_group_id" = Uuid, Path, description = "User group id")
    ),
    responses(
        (status = 204, description = "Grant revoked"),
        (status = 404, description = "Unknown chat group or grant", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn delete_group_permission(
    State(state): State<Arc<AppState>>,
    Path((group_id, user_group_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    if state
        .engine
        .grants()
        .delete_group_grant(group_id, user_group_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(grant_not_found())
    }
}

#[utoipa::path(
    get,
    path = "/api/chat-threads/{thread_id}/group-permissions",
    params(("thread_id" = Uuid, Path, description = "Chat thread id")),
    responses(
        (status = 200, description = "User-group grants on the thread", body = [ThreadGroupPermissionGrant]),
        (status = 404, description = "Unknown chat thread", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn list_thread_group_permissions(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
) -> AppResult<Json<Vec<ThreadGroupPermissionGrant>>> {
    Ok(Json(
        state.engine.grants().thread_group_grants(thread_id).await?,
    ))
}

#[utoipa::path(
    put,
    path = "/api/chat-threads/{thread_id}/group-permissions/{user_group_id}",
    params(
        ("thread_id" = Uuid, Path, description = "Chat thread id"),
        ("user_group_id" = Uuid, Path, description = "User group id")
    ),
    request_body = GrantScopeRequest,
    responses(
        (status = 200, description = "Grant stored", body = ThreadGroupPermissionGrant),
        (status = 400, description = "Scope not allowed on threads", body = ProblemDetails),
        (status = 404, description = "Unknown chat thread", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn put_thread_group_permission(
    State(state): State<Arc<AppState>>,
    Path((thread_id, user_group_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<GrantScopeRequest>,
) -> AppResult<Json<ThreadGroupPermissionGrant>> {
    let grant = state
        .engine
        .grants()
        .put_thread_group_grant(thread_id, user_group_id, request.scope)
        .await?;
    Ok(Json(grant))
}

#[utoipa::path(
    delete,
    path = "/api/chat-threads/{thread_id}/group-permissions/{user_group_id}",
    params(
        ("thread_id" = Uuid, Path, description = "Chat thread id"),
        ("user_group_id" = Uuid, Path, description = "User group id")
    ),
    responses(
        (status = 204, description = "Grant revoked"),
        (status = 404, description = "Unknown chat thread or grant", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn delete_thread_group_permission(
    State(state): State<Arc<AppState>>,
    Path((thread_id, user_group_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    if state
        .engine
        .grants()
        .delete_thread_group_grant(thread_id, user_group_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(grant_not_found())
    }
}

#[utoipa::path(
    get,
    path = "/api/chat-threads/{thread_id}/user-permissions",
    params(("thread_id" = Uuid, Path, description = "Chat thread id")),
    responses(
        (status = 200, description = "Direct grants on the thread", body = [ThreadUserPermissionGrant]),
        (status = 404, description = "Unknown chat thread", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn list_thread_user_permissions(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
) -> AppResult<Json<Vec<ThreadUserPermissionGrant>>> {
    Ok(Json(state.engine.grants().thread_user_grants(thread_id).await?))
}

#[utoipa::path(
    put,
    path = "/api/chat-threads/{thread_id}/user-permissions/{subject_id}",
    params(
        ("thread_id" = Uuid, Path, description = "Chat thread id"),
        ("subject_id" = Uuid, Path, description = "Subject id")
    ),
    request_body = GrantScopeRequest,
    responses(
        (status = 200, description = "Grant stored", body = ThreadUserPermissionGrant),
        (status = 400, description = "Scope not allowed on threads", body = ProblemDetails),
        (status = 404, description = "Unknown chat thread", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn put_thread_user_permission(
    State(state): State<Arc<AppState>>,
    Path((thread_id, subject_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<GrantScopeRequest>,
) -> AppResult<Json<ThreadUserPermissionGrant>> {
    let grant = state
        .engine
        .grants()
        .put_thread_user_grant(thread_id, subject_id, request.scope)
        .await?;
    Ok(Json(grant))
}

#[utoipa::path(
    delete,
    path = "/api/chat-threads/{thread_id}/user-permissions/{subject_id}",
    params(
        ("thread_id" = Uuid, Path, description = "Chat thread id"),
        ("subject_id" = Uuid, Path, description = "Subject id")
    ),
    responses(
        (status = 204, description = "Grant revoked"),
        (status = 404, description = "Unknown chat thread or grant", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn delete_thread_user_permission(
    State(state): State<Arc<AppState>>,
    Path((thread_id, subject_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    if state
        .engine
        .grants()
        .delete_thread_user_grant(thread_id, subject_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(grant_not_found())
    }
}

#[utoipa::path(
    get,
    path = "/api/chat-groups/{group_id}/scope",
    params(("group_id" = Uuid, Path, description = "Chat group id")),
    responses(
        (status = 200, description = "Caller's effective scope", body = ResolvedScopeResponse),
        (status = 401, description = "No subject identity", body = ProblemDetails),
        (status = 404, description = "Unknown chat group", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn group_scope(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(group_id): Path<Uuid>,
) -> AppResult<Json<ResolvedScopeResponse>> {
    let subject_id = context.require_subject()?;
    let scope = state
        .engine
        .resolver()
        .resolve_group(subject_id, group_id)
        .await?;
    Ok(Json(ResolvedScopeResponse { subject_id, scope }))
}

#[utoipa::path(
    get,
    path = "/api/chat-threads/{thread_id}/scope",
    params(("thread_id" = Uuid, Path, description = "Chat thread id")),
    responses(
        (status = 200, description = "Caller's effective scope", body = ResolvedScopeResponse),
        (status = 401, description = "No subject identity", body = ProblemDetails),
        (status = 404, description = "Unknown chat thread", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn thread_scope(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(thread_id): Path<Uuid>,
) -> AppResult<Json<ResolvedScopeResponse>> {
    let subject_id = context.require_subject()?;
    let scope = state
        .engine
        .resolver()
        .resolve_thread(subject_id, thread_id)
        .await?;
    Ok(Json(ResolvedScopeResponse { subject_id, scope }))
}

#[utoipa::path(
    get,
    path = "/api/chat-threads/{thread_id}/audience",
    params(("thread_id" = Uuid, Path, description = "Chat thread id")),
    responses(
        (status = 200, description = "Subjects able to read the thread", body = AudienceResponse),
        (status = 404, description = "Unknown chat thread", body = ProblemDetails)
    ),
    tag = "Permissions"
)]
pub async fn thread_audience(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
) -> AppResult<Json<AudienceResponse>> {
    let mut subjects: Vec<Uuid> = state
        .engine
        .audience()
        .audience_for(thread_id)
        .await?
        .into_iter()
        .collect();
    subjects.sort_unstable();
    Ok(Json(AudienceResponse {
        chat_thread_id: thread_id,
        subjects,
    }))
}
