#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{
    AudienceResponse, ChatGroup, ChatGroupType, ChatThread, EventEnvelope, GrantScopeRequest,
    GroupPermissionGrant, MessageCreatedEvent, MessageCreatedRequest, MessageCreatedResponse,
    MessageDeletedRequest, MessageDeletedResponse, Operation, ResolvedScopeResponse,
    ResourceEvent, Scope, ThreadGroupPermissionGrant, ThreadUserPermissionGrant, Topic,
    UnreadAcknowledgedResponse, UnreadCountsResponse, UnreadGroupCount, UnreadListResponse,
    UnreadMarker,
};
use utoipa::OpenApi;

use crate::http::problem::ProblemDetails;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Huddle API",
        version = "0.1.0",
        description = "Chat permission resolution, audience expansion and unread tracking"
    ),
    paths(
        crate::handlers::permissions::list_group_permissions,
        crate::handlers::permissions::put_group_permission,
        crate::handlers::permissions::delete_group_permission,
        crate::handlers::permissions::list_thread_group_permissions,
        crate::handlers::permissions::put_thread_group_permission,
        crate::handlers::permissions::delete_thread_group_permission,
        crate::handlers::permissions::list_thread_user_permissions,
        crate::handlers::permissions::put_thread_user_permission,
        crate::handlers::permissions::delete_thread_user_permission,
        crate::handlers::permissions::group_scope,
        crate::handlers::permissions::thread_scope,
        crate::handlers::permissions::thread_audience,
        crate::handlers::hooks::message_created,
        crate::handlers::hooks::message_deleted,
        crate::handlers::unreads::list_unreads,
        crate::handlers::unreads::acknowledge_unreads,
        crate::handlers::unreads::unread_counts,
        crate::handlers::events::event_stream,
    ),
    components(
        schemas(
            Scope,
            ChatGroup,
            ChatGroupType,
            ChatThread,
            GroupPermissionGrant,
            ThreadGroupPermissionGrant,
            ThreadUserPermissionGrant,
            GrantScopeRequest,
            ResolvedScopeResponse,
            AudienceResponse,
            MessageCreatedRequest,
            MessageCreatedResponse,
            MessageDeletedRequest,
            MessageDeletedResponse,
            UnreadMarker,
            UnreadListResponse,
            UnreadGroupCount,
            UnreadCountsResponse,
            UnreadAcknowledgedResponse,
            Topic,
            Operation,
            EventEnvelope,
            MessageCreatedEvent,
            ResourceEvent,
            ProblemDetails,
        )
    ),
    tags(
        (name = "Permissions", description = "Grant administration and scope resolution"),
        (name = "Hooks", description = "Message lifecycle notifications from the CRUD layer"),
        (name = "Unreads", description = "Per-subject unread markers"),
        (name = "Events", description = "Server-sent engine events")
    )
)]
pub struct ApiDoc;
