use std::{collections::HashSet, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{
    ChatGroup, ChatGroupType, ChatMessage, ChatThread, GroupPermissionGrant, Scope,
    ThreadGroupPermissionGrant, ThreadUserPermissionGrant, UnreadMarker, UnreadPath,
};
use sqlx::PgPool;
use tracing::{instrument, trace};
use uuid::Uuid;

use super::store::{ChatDirectory, PermissionStore, StoreError, StoreResult, UnreadStore};

/// Postgres-backed storage over the `huddle` schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl fmt::Debug for PgStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStore").finish()
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Turns a literal prefix into a `LIKE` pattern evaluated with `ESCAPE '\'`.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn parse_scope(raw: &str) -> StoreResult<Scope> {
    Scope::try_from(raw).map_err(|_| StoreError::Fatal(format!("unknown scope '{raw}' in storage")))
}

fn row_count(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: Uuid,
    group_type: String,
    archived: bool,
}

impl TryFrom<GroupRow> for ChatGroup {
    type Error = StoreError;

    fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
        let group_type = ChatGroupType::try_from(row.group_type.as_str())
            .map_err(|err| StoreError::Fatal(format!("{err}: {}", row.group_type)))?;
        Ok(Self {
            id: row.id,
            group_type,
            archived: row.archived,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ThreadRow {
    id: Uuid,
    chat_group_id: Uuid,
    archived: bool,
    owner_id: Option<Uuid>,
}

impl From<ThreadRow> for ChatThread {
    fn from(row: ThreadRow) -> Self {
        Self {
            id: row.id,
            chat_group_id: row.chat_group_id,
            archived: row.archived,
            owner_id: row.owner_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    chat_thread_id: Uuid,
    author_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MarkerRow {
    path: String,
    subject_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl ChatDirectory for PgStore {
    async fn group(&self, id: Uuid) -> StoreResult<Option<ChatGroup>> {
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT id, group_type, archived FROM huddle.chat_groups WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChatGroup::try_from).transpose()
    }

    async fn thread(&self, id: Uuid) -> StoreResult<Option<ChatThread>> {
        let row = sqlx::query_as::<_, ThreadRow>(
            "SELECT id, chat_group_id, archived, owner_id FROM huddle.chat_threads WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ChatThread::from))
    }

    async fn message(&self, id: Uuid) -> StoreResult<Option<ChatMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, chat_thread_id, author_id, created_at, updated_at \
             FROM huddle.chat_messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ChatMessage {
            id: row.id,
            chat_thread_id: row.chat_thread_id,
            author_id: row.author_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    async fn threads_in_group(&self, chat_group_id: Uuid) -> StoreResult<Vec<ChatThread>> {
        let rows = sqlx::query_as::<_, ThreadRow>(
            "SELECT id, chat_group_id, archived, owner_id FROM huddle.chat_threads \
             WHERE chat_group_id = $1 ORDER BY id",
        )
        .bind(chat_group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ChatThread::from).collect())
    }

    async fn group_ids(&self) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM huddle.chat_groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl PermissionStore for PgStore {
    async fn group_grants(&self, chat_group_id: Uuid) -> StoreResult<Vec<GroupPermissionGrant>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT user_group_id, scope FROM huddle.group_permissions WHERE chat_group_id = $1",
        )
        .bind(chat_group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_group_id, scope)| {
                Ok(GroupPermissionGrant {
                    chat_group_id,
                    user_group_id,
                    scope: parse_scope(&scope)?,
                })
            })
            .collect()
    }

    #[instrument(name = "store.upsert_group_grant", skip(self), err)]
    async fn upsert_group_grant(&self, grant: &GroupPermissionGrant) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO huddle.group_permissions (chat_group_id, user_group_id, scope) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (chat_group_id, user_group_id) \
             DO UPDATE SET scope = EXCLUDED.scope, updated_at = NOW()",
        )
        .bind(grant.chat_group_id)
        .bind(grant.user_group_id)
        .bind(grant.scope.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(name = "store.delete_group_grant", skip(self), err)]
    async fn delete_group_grant(
        &self,
        chat_group_id: Uuid,
        user_group_id: Uuid,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM huddle.group_permissions WHERE chat_group_id = $1 AND user_group_id = $2",
        )
        .bind(chat_group_id)
        .bind(user_group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn thread_group_grants(
        &self,
        chat_thread_id: Uuid,
    ) -> StoreResult<Vec<ThreadGroupPermissionGrant>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT user_group_id, scope FROM huddle.thread_group_permissions \
             WHERE chat_thread_id = $1",
        )
        .bind(chat_thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_group_id, scope)| {
                Ok(ThreadGroupPermissionGrant {
                    chat_thread_id,
                    user_group_id,
                    scope: parse_scope(&scope)?,
                })
            })
            .collect()
    }

    #[instrument(name = "store.upsert_thread_group_grant", skip(self), err)]
    async fn upsert_thread_group_grant(
        &self,
        grant: &ThreadGroupPermissionGrant,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO huddle.thread_group_permissions (chat_thread_id, user_group_id, scope) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (chat_thread_id, user_group_id) \
             DO UPDATE SET scope = EXCLUDED.scope, updated_at = NOW()",
        )
        .bind(grant.chat_thread_id)
        .bind(grant.user_group_id)
        .bind(grant.scope.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(name = "store.delete_thread_group_grant", skip(self), err)]
    async fn delete_thread_group_grant(
        &self,
        chat_thread_id: Uuid,
        user_group_id: Uuid,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM huddle.thread_group_permissions \
             WHERE chat_thread_id = $1 AND user_group_id = $2",
        )
        .bind(chat_thread_id)
        .bind(user_group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn thread_user_grants(
        &self,
        chat_thread_id: Uuid,
    ) -> StoreResult<Vec<ThreadUserPermissionGrant>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT subject_id, scope FROM huddle.thread_user_permissions \
             WHERE chat_thread_id = $1",
        )
        .bind(chat_thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(subject_id, scope)| {
                Ok(ThreadUserPermissionGrant {
                    chat_thread_id,
                    subject_id,
                    scope: parse_scope(&scope)?,
                })
            })
            .collect()
    }

    #[instrument(name = "store.upsert_thread_user_grant", skip(self), err)]
    async fn upsert_thread_user_grant(&self, grant: &ThreadUserPermissionGrant) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO huddle.thread_user_permissions (chat_thread_id, subject_id, scope) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (chat_thread_id, subject_id) \
             DO UPDATE SET scope = EXCLUDED.scope, updated_at = NOW()",
        )
        .bind(grant.chat_thread_id)
        .bind(grant.subject_id)
        .bind(grant.scope.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(name = "store.delete_thread_user_grant", skip(self), err)]
    async fn delete_thread_user_grant(
        &self,
        chat_thread_id: Uuid,
        subject_id: Uuid,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM huddle.thread_user_permissions \
             WHERE chat_thread_id = $1 AND subject_id = $2",
        )
        .bind(chat_thread_id)
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl UnreadStore for PgStore {
    #[instrument(
        name = "store.upsert_markers",
        skip(self, path, subjects),
        fields(path = %path, subjects = subjects.len()),
        err
    )]
    async fn upsert_markers(&self, path: &UnreadPath, subjects: &[Uuid]) -> StoreResult<u64> {
        if subjects.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "INSERT INTO huddle.unreads (path, subject_id) \
             SELECT $1, subject FROM UNNEST($2::uuid[]) AS subject \
             ON CONFLICT (path, subject_id) DO UPDATE SET updated_at = NOW()",
        )
        .bind(path.as_str())
        .bind(subjects)
        .execute(&self.pool)
        .await?;

        trace!(path = %path, rows = result.rows_affected(), "upserted unread markers");
        Ok(result.rows_affected())
    }

    #[instrument(name = "store.delete_path", skip(self, path), fields(path = %path), err)]
    async fn delete_path(&self, path: &UnreadPath) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM huddle.unreads WHERE path = $1")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(name = "store.delete_prefix_for_subject", skip(self), err)]
    async fn delete_prefix_for_subject(&self, subject_id: Uuid, prefix: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r"DELETE FROM huddle.unreads WHERE subject_id = $1 AND path LIKE $2 ESCAPE '\'",
        )
        .bind(subject_id)
        .bind(like_prefix(prefix))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn holders_with_prefix(&self, prefix: &str) -> StoreResult<HashSet<Uuid>> {
        let holders = sqlx::query_scalar::<_, Uuid>(
            r"SELECT DISTINCT subject_id FROM huddle.unreads WHERE path LIKE $1 ESCAPE '\'",
        )
        .bind(like_prefix(prefix))
        .fetch_all(&self.pool)
        .await?;
        Ok(holders.into_iter().collect())
    }

    async fn list_for_subject(
        &self,
        subject_id: Uuid,
        prefix: &str,
    ) -> StoreResult<Vec<UnreadMarker>> {
        let rows = sqlx::query_as::<_, MarkerRow>(
            r"SELECT path, subject_id, created_at, updated_at FROM huddle.unreads
              WHERE subject_id = $1 AND path LIKE $2 ESCAPE '\'
              ORDER BY path",
        )
        .bind(subject_id)
        .bind(like_prefix(prefix))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UnreadMarker {
                path: row.path,
                subject_id: row.subject_id,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
            .collect())
    }

    async fn count_for_subject(&self, subject_id: Uuid, prefix: &str) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM huddle.unreads WHERE subject_id = $1 AND path LIKE $2 ESCAPE '\'",
        )
        .bind(subject_id)
        .bind(like_prefix(prefix))
        .fetch_one(&self.pool)
        .await?;
        Ok(row_count(count))
    }

    #[instrument(name = "store.prune_rollup", skip(self), err)]
    async fn prune_rollup(&self, subject_id: Uuid, chat_group_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r"DELETE FROM huddle.unreads AS rollup
              WHERE rollup.subject_id = $1 AND rollup.path = $2
                AND NOT EXISTS (
                    SELECT 1 FROM huddle.unreads AS leaf
                    WHERE leaf.subject_id = $1 AND leaf.path LIKE $3 ESCAPE '\'
                )",
        )
        .bind(subject_id)
        .bind(UnreadPath::group(chat_group_id).as_str())
        .bind(like_prefix(&UnreadPath::group_leaf_prefix(chat_group_id)))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_prefix_escapes_pattern_characters() {
        assert_eq!(like_prefix("chat-"), "chat-%");
        assert_eq!(like_prefix(""), "%");
        assert_eq!(like_prefix("a_b%c\\"), "a\\_b\\%c\\\\%");
    }

    #[test]
    fn unknown_scope_values_are_fatal() {
        assert_eq!(parse_scope("MANAGE"), Ok(Scope::Manage));
        assert!(matches!(parse_scope("OWNER"), Err(StoreError::Fatal(_))));
    }

    #[test]
    fn group_rows_reject_unknown_types() {
        let row = GroupRow {
            id: Uuid::new_v4(),
            group_type: "FORUM".into(),
            archived: false,
        };
        assert!(ChatGroup::try_from(row).is_err());
    }
}
