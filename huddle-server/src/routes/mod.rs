use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};

use crate::{
    app_state::AppState,
    handlers::{events, hooks, permissions, unreads},
};

pub mod health;
pub mod openapi;

/// Every route nested under `/api`.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/chat-groups/{group_id}/permissions",
            get(permissions::list_group_permissions),
        )
        .route(
            "/chat-groups/{group_id}/permissions/{user_group_id}",
            put(permissions::put_group_permission).delete(permissions::delete_group_permission),
        )
        .route("/chat-groups/{group_id}/scope", get(permissions::group_scope))
        .route(
            "/chat-threads/{thread_id}/group-permissions",
            get(permissions::list_thread_group_permissions),
        )
        .route(
            "/chat-threads/{thread_id}/group-permissions/{user_group_id}",
            put(permissions::put_thread_group_permission)
                .delete(permissions::delete_thread_group_permission),
        )
        .route(
            "/chat-threads/{thread_id}/user-permissions",
            get(permissions::list_thread_user_permissions),
        )
        .route(
            "/chat-threads/{thread_id}/user-permissions/{subject_id}",
            put(permissions::put_thread_user_permission)
                .delete(permissions::delete_thread_user_permission),
        )
        .route("/chat-threads/{thread_id}/scope", get(permissions::thread_scope))
        .route(
            "/chat-threads/{thread_id}/audience",
            get(permissions::thread_audience),
        )
        .route("/hooks/messages/created", post(hooks::message_created))
        .route("/hooks/messages/deleted", post(hooks::message_deleted))
        .route(
            "/unreads",
            get(unreads::list_unreads).delete(unreads::acknowledge_unreads),
        )
        .route("/unreads/counts", get(unreads::unread_counts))
        .route("/events", get(events::event_stream))
        .merge(openapi::openapi_routes())
}
