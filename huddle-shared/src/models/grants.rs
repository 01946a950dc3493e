use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::Scope;

/// Grants `scope` on a chat group to every member of a user group.
/// Unique per `(chat_group_id, user_group_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupPermissionGrant {
    pub chat_group_id: Uuid,
    pub user_group_id: Uuid,
    pub scope: Scope,
}

/// Grants `scope` on a single thread to every member of a user group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThreadGroupPermissionGrant {
    pub chat_thread_id: Uuid,
    pub user_group_id: Uuid,
    pub scope: Scope,
}

/// Grants `scope` on a single thread directly to one subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThreadUserPermissionGrant {
    pub chat_thread_id: Uuid,
    pub subject_id: Uuid,
    pub scope: Scope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrantScopeRequest {
    pub scope: Scope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedScopeResponse {
    pub subject_id: Uuid,
    #[serde(default)]
    pub scope: Option<Scope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AudienceResponse {
    pub chat_thread_id: Uuid,
    pub subjects: Vec<Uuid>,
}
