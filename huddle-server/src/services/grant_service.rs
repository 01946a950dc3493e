use std::{fmt, sync::Arc};

use shared::models::{
    GroupPermissionGrant, ResourceEvent, Scope, ThreadGroupPermissionGrant,
    ThreadUserPermissionGrant, Topic,
};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    error::{EngineError, EngineResult},
    event_publisher::{EventPublisher, publish_best_effort},
    reconciler::{PermissionChangeReconciler, ReconcileTarget},
};
use crate::db::{ChatDirectory, PermissionStore};

/// Grant administration. Every committed write schedules reconciliation of
/// the affected resource and announces the change; neither waits.
#[derive(Clone)]
pub struct GrantService {
    directory: Arc<dyn ChatDirectory>,
    permissions: Arc<dyn PermissionStore>,
    reconciler: PermissionChangeReconciler,
    publisher: Arc<dyn EventPublisher>,
}

impl fmt::Debug for GrantService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantService").finish_non_exhaustive()
    }
}

impl GrantService {
    pub fn new(
        directory: Arc<dyn ChatDirectory>,
        permissions: Arc<dyn PermissionStore>,
        reconciler: PermissionChangeReconciler,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            directory,
            permissions,
            reconciler,
            publisher,
        }
    }

    async fn require_group(&self, chat_group_id: Uuid) -> EngineResult<()> {
        match self.directory.group(chat_group_id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::group_not_found(chat_group_id)),
        }
    }

    async fn require_thread(&self, chat_thread_id: Uuid) -> EngineResult<()> {
        match self.directory.thread(chat_thread_id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::thread_not_found(chat_thread_id)),
        }
    }

    fn check_thread_scope(scope: Scope) -> EngineResult<()> {
        if scope.allowed_on_thread() {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "scope {scope} cannot be granted on a chat thread"
            )))
        }
    }

    async fn committed(&self, target: ReconcileTarget) {
        self.reconciler.enqueue(target);
        let (topic, id) = match target {
            ReconcileTarget::Group(id) => (Topic::ChatGroups, id),
            ReconcileTarget::Thread(id) => (Topic::ChatThreads, id),
        };
        publish_best_effort(self.publisher.as_ref(), topic, &ResourceEvent::updated(id)).await;
    }

    pub async fn group_grants(&self, chat_group_id: Uuid) -> EngineResult<Vec<GroupPermissionGrant>> {
        self.require_group(chat_group_id).await?;
        Ok(self.permissions.group_grants(chat_group_id).await?)
    }

    #[instrument(name = "grants.put_group", skip(self), err)]
    pub async fn put_group_grant(
        &self,
        chat_group_id: Uuid,
        user_group_id: Uuid,
        scope: Scope,
    ) -> EngineResult<GroupPermissionGrant> {
        self.require_group(chat_group_id).await?;
        let grant = GroupPermissionGrant {
            chat_group_id,
            user_group_id,
            scope,
        };
        self.permissions.upsert_group_grant(&grant).await?;
        info!(%chat_group_id, %user_group_id, %scope, "group grant stored");
        self.committed(ReconcileTarget::Group(chat_group_id)).await;
        Ok(grant)
    }

    /// Returns whether a grant existed.
    #[instrument(name = "grants.delete_group", skip(self), err)]
    pub async fn delete_group_grant(
        &self,
        chat_group_id: Uuid,
        user_group_id: Uuid,
    ) -> EngineResult<bool> {
        self.require_group(chat_group_id).await?;
        let deleted = self
            .permissions
            .delete_group_grant(chat_group_id, user_group_id)
            .await?;
        if deleted {
            info!(%chat_group_id, %user_group_id, "group grant revoked");
            self.committed(ReconcileTarget::Group(chat_group_id)).await;
        }
        Ok(deleted)
    }

    pub async fn thread_group_grants(
        &self,
        chat_thread_id: Uuid,
    ) -> EngineResult<Vec<ThreadGroupPermissionGrant>> {
        self.require_thread(chat_thread_id).await?;
        Ok(self.permissions.thread_group_grants(chat_thread_id).await?)
    }

    #[instrument(name = "grants.put_thread_group", skip(self), err)]
    pub async fn put_thread_group_grant(
        &self,
        chat_thread_id: Uuid,
        user_group_id: Uuid,
        scope: Scope,
    ) -> EngineResult<ThreadGroupPermissionGrant> {
        Self::check_thread_scope(scope)?;
        self.require_thread(chat_thread_id).await?;
        let grant = ThreadGroupPermissionGrant {
            chat_thread_id,
            user_group_id,
            scope,
        };
        self.permissions.upsert_thread_group_grant(&grant).await?;
        self.committed(ReconcileTarget::Thread(chat_thread_id)).await;
        Ok(grant)
    }

    #[instrument(name = "grants.delete_thread_group", skip(self), err)]
    pub async fn delete_thread_group_grant(
        &self,
        chat_thread_id: Uuid,
        user_group_id: Uuid,
    ) -> EngineResult<bool> {
        self.require_thread(chat_thread_id).await?;
        let deleted = self
            .permissions
            .delete_thread_group_grant(chat_thread_id, user_group_id)
            .await?;
        if deleted {
            self.committed(ReconcileTarget::Thread(chat_thread_id)).await;
        }
        Ok(deleted)
    }

    pub async fn thread_user_grants(
        &self,
        chat_thread_id: Uuid,
    ) -> EngineResult<Vec<ThreadUserPermissionGrant>> {
        self.require_thread(chat_thread_id).await?;
        Ok(self.permissions.thread_user_grants(chat_thread_id).await?)
    }

    #[instrument(name = "grants.put_thread_user", skip(self), err)]
    pub async fn put_thread_user_grant(
        &self,
        chat_thread_id: Uuid,
        subject_id: Uuid,
        scope: Scope,
    ) -> EngineResult<ThreadUserPermissionGrant> {
        Self::check_thread_scope(scope)?;
        self.require_thread(chat_thread_id).await?;
        let grant = ThreadUserPermissionGrant {
            chat_thread_id,
            subject_id,
            scope,
        };
        self.permissions.upsert_thread_user_grant(&grant).await?;
        self.committed(ReconcileTarget::Thread(chat_thread_id)).await;
        Ok(grant)
    }

    #[instrument(name = "grants.delete_thread_user", skip(self), err)]
    pub async fn delete_thread_user_grant(
        &self,
        chat_thread_id: Uuid,
        subject_id: Uuid,
    ) -> EngineResult<bool> {
        self.require_thread(chat_thread_id).await?;
        let deleted = self
            .permissions
            .delete_thread_user_grant(chat_thread_id, subject_id)
            .await?;
        if deleted {
            self.committed(ReconcileTarget::Thread(chat_thread_id)).await;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{MemoryStore, UnreadStore},
        services::{
            audience::AudienceCalculator, event_publisher::RecordingPublisher,
            membership::StaticMembership, retry::RetryPolicy,
        },
    };
    use serde_json::json;
    use shared::models::{ChatGroupType, UnreadPath};

    struct Fixture {
        store: Arc<MemoryStore>,
        membership: Arc<StaticMembership>,
        publisher: Arc<RecordingPublisher>,
        reconciler: PermissionChangeReconciler,
        grants: GrantService,
        group: Uuid,
        thread: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let membership = Arc::new(StaticMembership::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let (group, thread) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_group(group, ChatGroupType::Chat).await;
        store.insert_thread(thread, group, None).await;

        let audience = AudienceCalculator::new(store.clone(), store.clone(), membership.clone());
        let reconciler = PermissionChangeReconciler::new(
            store.clone(),
            store.clone(),
            audience,
            RetryPolicy::default(),
            2,
        );
        let grants = GrantService::new(
            store.clone(),
            store.clone(),
            reconciler.clone(),
            publisher.clone(),
        );
        Fixture {
            store,
            membership,
            publisher,
            reconciler,
            grants,
            group,
            thread,
        }
    }

    #[tokio::test]
    async fn put_replaces_scope_and_announces_update() {
        let f = fixture().await;
        let readers = Uuid::new_v4();

        f.grants
            .put_group_grant(f.group, readers, Scope::Traverse)
            .await
            .unwrap();
        f.grants
            .put_group_grant(f.group, readers, Scope::Manage)
            .await
            .unwrap();

        let stored = f.grants.group_grants(f.group).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].scope, Scope::Manage);
        assert_eq!(
            f.publisher.events_for(Topic::ChatGroups),
            vec![
                json!({ "operation": "UPDATED", "id": f.group }),
                json!({ "operation": "UPDATED", "id": f.group }),
            ]
        );
        f.reconciler.settled().await;
    }

    #[tokio::test]
    async fn traverse_is_rejected_on_threads() {
        let f = fixture().await;
        assert!(matches!(
            f.grants
                .put_thread_user_grant(f.thread, Uuid::new_v4(), Scope::Traverse)
                .await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            f.grants
                .put_thread_group_grant(f.thread, Uuid::new_v4(), Scope::Traverse)
                .await,
            Err(EngineError::Validation(_))
        ));
        assert!(f.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let f = fixture().await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            f.grants.put_group_grant(missing, Uuid::new_v4(), Scope::Access).await,
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            f.grants.thread_user_grants(missing).await,
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            f.grants.delete_thread_group_grant(missing, Uuid::new_v4()).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn deleting_a_missing_grant_has_no_side_effects() {
        let f = fixture().await;
        assert!(
            !f.grants
                .delete_thread_user_grant(f.thread, Uuid::new_v4())
                .await
                .unwrap()
        );
        assert!(f.publisher.events().is_empty());
        assert_eq!(f.reconciler.completed_passes(), 0);
    }

    #[tokio::test]
    async fn revoking_thread_group_grant_clears_member_unreads() {
        let f = fixture().await;
        let (team, member) = (Uuid::new_v4(), Uuid::new_v4());
        f.membership.add_member(team, member);
        f.grants
            .put_thread_group_grant(f.thread, team, Scope::Access)
            .await
            .unwrap();

        let leaf = UnreadPath::leaf(f.group, f.thread, Uuid::new_v4());
        f.store.upsert_markers(&leaf, &[member]).await.unwrap();

        assert!(
            f.grants
                .delete_thread_group_grant(f.thread, team)
                .await
                .unwrap()
        );
        f.reconciler.settled().await;

        assert!(f.store.list_for_subject(member, "").await.unwrap().is_empty());
        assert_eq!(
            f.publisher.events_for(Topic::ChatThreads).len(),
            2,
            "one update per committed write"
        );
    }
}
