//! In-process implementation of every storage trait, used by tests and by
//! `serve --in-memory`.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    ops::Bound,
    sync::atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{
    ChatGroup, ChatGroupType, ChatMessage, ChatThread, GroupPermissionGrant, Scope,
    ThreadGroupPermissionGrant, ThreadUserPermissionGrant, UnreadMarker, UnreadPath,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::{ChatDirectory, PermissionStore, StoreError, StoreResult, UnreadStore};

#[derive(Debug, Clone, Copy)]
struct MarkerTimes {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    groups: HashMap<Uuid, ChatGroup>,
    threads: HashMap<Uuid, ChatThread>,
    messages: HashMap<Uuid, ChatMessage>,
    group_grants: BTreeMap<(Uuid, Uuid), Scope>,
    thread_group_grants: BTreeMap<(Uuid, Uuid), Scope>,
    thread_user_grants: BTreeMap<(Uuid, Uuid), Scope>,
    unreads: BTreeMap<(String, Uuid), MarkerTimes>,
}

impl MemoryState {
    fn unread_keys_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a (String, Uuid), &'a MarkerTimes)> + 'a {
        self.unreads
            .range((
                Bound::Included((prefix.to_string(), Uuid::nil())),
                Bound::Unbounded,
            ))
            .take_while(move |((path, _), _)| path.starts_with(prefix))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    failing_unread_writes: AtomicU32,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_group(&self, id: Uuid, group_type: ChatGroupType) -> ChatGroup {
        let group = ChatGroup {
            id,
            group_type,
            archived: false,
        };
        self.state.write().await.groups.insert(id, group.clone());
        group
    }

    pub async fn insert_thread(
        &self,
        id: Uuid,
        chat_group_id: Uuid,
        owner_id: Option<Uuid>,
    ) -> ChatThread {
        let thread = ChatThread {
            id,
            chat_group_id,
            archived: false,
            owner_id,
        };
        self.state.write().await.threads.insert(id, thread.clone());
        thread
    }

    pub async fn insert_message(&self, id: Uuid, chat_thread_id: Uuid, author_id: Uuid) {
        let now = Utc::now();
        self.state.write().await.messages.insert(
            id,
            ChatMessage {
                id,
                chat_thread_id,
                author_id,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub async fn archive_thread(&self, id: Uuid) {
        if let Some(thread) = self.state.write().await.threads.get_mut(&id) {
            thread.archived = true;
        }
    }

    pub async fn remove_thread(&self, id: Uuid) {
        self.state.write().await.threads.remove(&id);
    }

    /// Makes the next `count` unread mutations fail with a transient error.
    pub fn fail_unread_writes(&self, count: u32) {
        self.failing_unread_writes.store(count, Ordering::SeqCst);
    }

    pub async fn marker_count(&self) -> usize {
        self.state.read().await.unreads.len()
    }

    fn check_unread_write(&self) -> StoreResult<()> {
        let injected = self
            .failing_unread_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            Err(StoreError::Transient("injected unread write failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatDirectory for MemoryStore {
    async fn group(&self, id: Uuid) -> StoreResult<Option<ChatGroup>> {
        Ok(self.state.read().await.groups.get(&id).cloned())
    }

    async fn thread(&self, id: Uuid) -> StoreResult<Option<ChatThread>> {
        Ok(self.state.read().await.threads.get(&id).cloned())
    }

    async fn message(&self, id: Uuid) -> StoreResult<Option<ChatMessage>> {
        Ok(self.state.read().await.messages.get(&id).cloned())
    }

    async fn threads_in_group(&self, chat_group_id: Uuid) -> StoreResult<Vec<ChatThread>> {
        let state = self.state.read().await;
        let mut threads: Vec<ChatThread> = state
            .threads
            .values()
            .filter(|thread| thread.chat_group_id == chat_group_id)
            .cloned()
            .collect();
        threads.sort_by_key(|thread| thread.id);
        Ok(threads)
    }

    async fn group_ids(&self) -> StoreResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.state.read().await.groups.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

fn grants_for<T>(
    grants: &BTreeMap<(Uuid, Uuid), Scope>,
    resource_id: Uuid,
    build: impl Fn(Uuid, Scope) -> T,
) -> Vec<T> {
    grants
        .range((resource_id, Uuid::nil())..=(resource_id, Uuid::from_u128(u128::MAX)))
        .map(|(&(_, holder), &scope)| build(holder, scope))
        .collect()
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn group_grants(&self, chat_group_id: Uuid) -> StoreResult<Vec<GroupPermissionGrant>> {
        let state = self.state.read().await;
        Ok(grants_for(
            &state.group_grants,
            chat_group_id,
            |user_group_id, scope| GroupPermissionGrant {
                chat_group_id,
                user_group_id,
                scope,
            },
        ))
    }

    async fn upsert_group_grant(&self, grant: &GroupPermissionGrant) -> StoreResult<()> {
        self.state
            .write()
            .await
            .group_grants
            .insert((grant.chat_group_id, grant.user_group_id), grant.scope);
        Ok(())
    }

    async fn delete_group_grant(
        &self,
        chat_group_id: Uuid,
        user_group_id: Uuid,
    ) -> StoreResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .group_grants
            .remove(&(chat_group_id, user_group_id))
            .is_some())
    }

    async fn thread_group_grants(
        &self,
        chat_thread_id: Uuid,
    ) -> StoreResult<Vec<ThreadGroupPermissionGrant>> {
        let state = self.state.read().await;
        Ok(grants_for(
            &state.thread_group_grants,
            chat_thread_id,
            |user_group_id, scope| ThreadGroupPermissionGrant {
                chat_thread_id,
                user_group_id,
                scope,
            },
        ))
    }

    async fn upsert_thread_group_grant(
        &self,
        grant: &ThreadGroupPermissionGrant,
    ) -> StoreResult<()> {
        self.state
            .write()
            .await
            .thread_group_grants
            .insert((grant.chat_thread_id, grant.user_group_id), grant.scope);
        Ok(())
    }

    async fn delete_thread_group_grant(
        &self,
        chat_thread_id: Uuid,
        user_group_id: Uuid,
    ) -> StoreResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .thread_group_grants
            .remove(&(chat_thread_id, user_group_id))
            .is_some())
    }

    async fn thread_user_grants(
        &self,
        chat_thread_id: Uuid,
    ) -> StoreResult<Vec<ThreadUserPermissionGrant>> {
        let state = self.state.read().await;
        Ok(grants_for(
            &state.thread_user_grants,
            chat_thread_id,
            |subject_id, scope| ThreadUserPermissionGrant {
                chat_thread_id,
                subject_id,
                scope,
            },
        ))
    }

    async fn upsert_thread_user_grant(&self, grant: &ThreadUserPermissionGrant) -> StoreResult<()> {
        self.state
            .write()
            .await
            .thread_user_grants
            .insert((grant.chat_thread_id, grant.subject_id), grant.scope);
        Ok(())
    }

    async fn delete_thread_user_grant(
        &self,
        chat_thread_id: Uuid,
        subject_id: Uuid,
    ) -> StoreResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .thread_user_grants
            .remove(&(chat_thread_id, subject_id))
            .is_some())
    }
}

#[async_trait]
impl UnreadStore for MemoryStore {
    async fn upsert_markers(&self, path: &UnreadPath, subjects: &[Uuid]) -> StoreResult<u64> {
        self.check_unread_write()?;
        let now = Utc::now();
        let mut state = self.state.write().await;
        for subject in subjects {
            state
                .unreads
                .entry((path.as_str().to_string(), *subject))
                .and_modify(|times| times.updated_at = now)
                .or_insert(MarkerTimes {
                    created_at: now,
                    updated_at: now,
                });
        }
        Ok(subjects.len() as u64)
    }

    async fn delete_path(&self, path: &UnreadPath) -> StoreResult<u64> {
        self.check_unread_write()?;
        let mut state = self.state.write().await;
        let before = state.unreads.len();
        state.unreads.retain(|(marker_path, _), _| marker_path != path.as_str());
        Ok((before - state.unreads.len()) as u64)
    }

    async fn delete_prefix_for_subject(&self, subject_id: Uuid, prefix: &str) -> StoreResult<u64> {
        self.check_unread_write()?;
        let mut state = self.state.write().await;
        let doomed: Vec<(String, Uuid)> = state
            .unread_keys_with_prefix(prefix)
            .filter(|((_, subject), _)| *subject == subject_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.unreads.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn holders_with_prefix(&self, prefix: &str) -> StoreResult<HashSet<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .unread_keys_with_prefix(prefix)
            .map(|((_, subject), _)| *subject)
            .collect())
    }

    async fn list_for_subject(
        &self,
        subject_id: Uuid,
        prefix: &str,
    ) -> StoreResult<Vec<UnreadMarker>> {
        let state = self.state.read().await;
        Ok(state
            .unread_keys_with_prefix(prefix)
            .filter(|((_, subject), _)| *subject == subject_id)
            .map(|((path, subject), times)| UnreadMarker {
                path: path.clone(),
                subject_id: *subject,
                created_at: times.created_at,
                updated_at: times.updated_at,
            })
            .collect())
    }

    async fn count_for_subject(&self, subject_id: Uuid, prefix: &str) -> StoreResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .unread_keys_with_prefix(prefix)
            .filter(|((_, subject), _)| *subject == subject_id)
            .count() as u64)
    }

    async fn prune_rollup(&self, subject_id: Uuid, chat_group_id: Uuid) -> StoreResult<bool> {
        self.check_unread_write()?;
        let leaf_prefix = UnreadPath::group_leaf_prefix(chat_group_id);
        let mut state = self.state.write().await;
        let has_leaves = state
            .unread_keys_with_prefix(&leaf_prefix)
            .any(|((_, subject), _)| *subject == subject_id);
        if has_leaves {
            return Ok(false);
        }
        let rollup = UnreadPath::group(chat_group_id).into_string();
        Ok(state.unreads.remove(&(rollup, subject_id)).is_some())
    }
}
