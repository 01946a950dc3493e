use std::collections::HashSet;

use async_trait::async_trait;
use shared::models::{
    ChatGroup, ChatMessage, ChatThread, GroupPermissionGrant, ThreadGroupPermissionGrant,
    ThreadUserPermissionGrant, UnreadMarker, UnreadPath,
};
use thiserror::Error;
use uuid::Uuid;

/// Storage failures, split by whether repeating the operation can help.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Fatal(String),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// SQLSTATE codes worth retrying: serialization failure, deadlock,
/// admin shutdown, lock not available.
const TRANSIENT_SQLSTATES: [&str; 4] = ["40001", "40P01", "57P01", "55P03"];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => Self::Transient(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let transient = db_err.code().is_some_and(|code| {
                    TRANSIENT_SQLSTATES.contains(&code.as_ref()) || code.starts_with("08")
                });
                if transient {
                    Self::Transient(err.to_string())
                } else {
                    Self::Fatal(err.to_string())
                }
            }
            _ => Self::Fatal(err.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read-only view of the chat hierarchy owned by the CRUD layer.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    async fn group(&self, id: Uuid) -> StoreResult<Option<ChatGroup>>;
    async fn thread(&self, id: Uuid) -> StoreResult<Option<ChatThread>>;
    async fn message(&self, id: Uuid) -> StoreResult<Option<ChatMessage>>;
    async fn threads_in_group(&self, chat_group_id: Uuid) -> StoreResult<Vec<ChatThread>>;
    async fn group_ids(&self) -> StoreResult<Vec<Uuid>>;
}

/// Grant rows for the three permission kinds. Upserts replace the scope of
/// the existing row for the same key; deletes report whether a row existed.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn group_grants(&self, chat_group_id: Uuid) -> StoreResult<Vec<GroupPermissionGrant>>;
    async fn upsert_group_grant(&self, grant: &GroupPermissionGrant) -> StoreResult<()>;
    async fn delete_group_grant(&self, chat_group_id: Uuid, user_group_id: Uuid)
    -> StoreResult<bool>;

    async fn thread_group_grants(
        &self,
        chat_thread_id: Uuid,
    ) -> StoreResult<Vec<ThreadGroupPermissionGrant>>;
    async fn upsert_thread_group_grant(&self, grant: &ThreadGroupPermissionGrant)
    -> StoreResult<()>;
    async fn delete_thread_group_grant(
        &self,
        chat_thread_id: Uuid,
        user_group_id: Uuid,
    ) -> StoreResult<bool>;

    async fn thread_user_grants(
        &self,
        chat_thread_id: Uuid,
    ) -> StoreResult<Vec<ThreadUserPermissionGrant>>;
    async fn upsert_thread_user_grant(&self, grant: &ThreadUserPermissionGrant)
    -> StoreResult<()>;
    async fn delete_thread_user_grant(
        &self,
        chat_thread_id: Uuid,
        subject_id: Uuid,
    ) -> StoreResult<bool>;
}

/// The unread index, keyed by `(path, subject_id)`.
///
/// Every mutation is idempotent so callers may repeat it after a transient
/// failure. Prefix arguments are literal prefixes, never patterns.
#[async_trait]
pub trait UnreadStore: Send + Sync {
    /// Inserts a marker per subject, refreshing `updated_at` on existing ones.
    async fn upsert_markers(&self, path: &UnreadPath, subjects: &[Uuid]) -> StoreResult<u64>;

    /// Removes the marker at `path` for every subject.
    async fn delete_path(&self, path: &UnreadPath) -> StoreResult<u64>;

    async fn delete_prefix_for_subject(&self, subject_id: Uuid, prefix: &str) -> StoreResult<u64>;

    /// Subjects holding at least one marker under `prefix`.
    async fn holders_with_prefix(&self, prefix: &str) -> StoreResult<HashSet<Uuid>>;

    async fn list_for_subject(
        &self,
        subject_id: Uuid,
        prefix: &str,
    ) -> StoreResult<Vec<UnreadMarker>>;

    async fn count_for_subject(&self, subject_id: Uuid, prefix: &str) -> StoreResult<u64>;

    /// Drops the subject's `chat-{group}` rollup unless a leaf marker remains
    /// under the group. Returns whether the rollup was removed.
    async fn prune_rollup(&self, subject_id: Uuid, chat_group_id: Uuid) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn pool_and_io_errors_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_transient());
        assert!(
            StoreError::from(sqlx::Error::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset"
            )))
            .is_transient()
        );
    }

    #[test]
    fn decoding_errors_are_fatal() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("storage failure"));
    }
}
