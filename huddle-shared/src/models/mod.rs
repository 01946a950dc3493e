pub mod chat;
pub mod events;
pub mod grants;
pub mod scope;
pub mod unread;

pub use chat::{
    ChatGroup, ChatGroupType, ChatMessage, ChatThread, MessageCreatedRequest,
    MessageCreatedResponse, MessageDeletedRequest, MessageDeletedResponse,
};
pub use events::{EventEnvelope, MessageCreatedEvent, Operation, ResourceEvent, Topic};
pub use grants::{
    AudienceResponse, GrantScopeRequest, GroupPermissionGrant, ResolvedScopeResponse,
    ThreadGroupPermissionGrant, ThreadUserPermissionGrant,
};
pub use scope::Scope;
pub use unread::{
    PathError, UnreadAcknowledgedResponse, UnreadCountsResponse, UnreadGroupCount,
    UnreadListResponse, UnreadMarker, UnreadPath, UnreadPathKind, normalize_path_like,
};
