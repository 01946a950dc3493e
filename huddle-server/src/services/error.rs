use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use super::membership::MembershipError;
use crate::db::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ChatGroup,
    ChatThread,
    Grant,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ChatGroup => "chat group",
            Self::ChatThread => "chat thread",
            Self::Grant => "grant",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: Uuid },
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// Only raised where an empty member set would be destructive.
    #[error(transparent)]
    Membership(#[from] MembershipError),
}

impl EngineError {
    pub fn group_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: ResourceKind::ChatGroup,
            id,
        }
    }

    pub fn thread_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: ResourceKind::ChatThread,
            id,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
