use std::{collections::HashSet, fmt, sync::Arc};

use shared::models::{ChatThread, Scope};
use tracing::instrument;
use uuid::Uuid;

use super::{
    error::{EngineError, EngineResult},
    membership::{GroupMembershipLookup, groups_or_empty},
};
use crate::db::{ChatDirectory, PermissionStore, StoreResult};

/// A resource a scope can be resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    ChatGroup(Uuid),
    ChatThread(Uuid),
}

/// Computes a subject's effective scope as the lattice maximum over every
/// candidate source. Read-only; safe to call concurrently.
#[derive(Clone)]
pub struct PermissionResolver {
    directory: Arc<dyn ChatDirectory>,
    permissions: Arc<dyn PermissionStore>,
    membership: Arc<dyn GroupMembershipLookup>,
}

impl fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionResolver").finish()
    }
}

impl PermissionResolver {
    pub fn new(
        directory: Arc<dyn ChatDirectory>,
        permissions: Arc<dyn PermissionStore>,
        membership: Arc<dyn GroupMembershipLookup>,
    ) -> Self {
        Self {
            directory,
            permissions,
            membership,
        }
    }

    pub async fn resolve(&self, subject_id: Uuid, resource: Resource) -> EngineResult<Option<Scope>> {
        match resource {
            Resource::ChatGroup(id) => self.resolve_group(subject_id, id).await,
            Resource::ChatThread(id) => self.resolve_thread(subject_id, id).await,
        }
    }

    #[instrument(name = "resolver.group", skip(self), err)]
    pub async fn resolve_group(
        &self,
        subject_id: Uuid,
        chat_group_id: Uuid,
    ) -> EngineResult<Option<Scope>> {
        if self.directory.group(chat_group_id).await?.is_none() {
            return Err(EngineError::group_not_found(chat_group_id));
        }
        let groups = groups_or_empty(self.membership.as_ref(), subject_id).await;
        Ok(self.group_scope(chat_group_id, &groups).await?)
    }

    #[instrument(name = "resolver.thread", skip(self), err)]
    pub async fn resolve_thread(
        &self,
        subject_id: Uuid,
        chat_thread_id: Uuid,
    ) -> EngineResult<Option<Scope>> {
        let thread = self
            .directory
            .thread(chat_thread_id)
            .await?
            .ok_or_else(|| EngineError::thread_not_found(chat_thread_id))?;
        Ok(self.thread_scope(subject_id, &thread).await?)
    }

    pub async fn can_read_thread(&self, subject_id: Uuid, chat_thread_id: Uuid) -> EngineResult<bool> {
        let scope = self.resolve_thread(subject_id, chat_thread_id).await?;
        Ok(scope.is_some_and(Scope::grants_read))
    }

    async fn thread_scope(&self, subject_id: Uuid, thread: &ChatThread) -> StoreResult<Option<Scope>> {
        let groups = groups_or_empty(self.membership.as_ref(), subject_id).await;

        let direct = self
            .permissions
            .thread_user_grants(thread.id)
            .await?
            .into_iter()
            .filter(|grant| grant.subject_id == subject_id)
            .map(|grant| grant.scope)
            .max();

        let via_groups = self
            .permissions
            .thread_group_grants(thread.id)
            .await?
            .into_iter()
            .filter(|grant| groups.contains(&grant.user_group_id))
            .map(|grant| grant.scope)
            .max();

        // Group managers see every thread of the group.
        let implied = self
            .group_scope(thread.chat_group_id, &groups)
            .await?
            .filter(|scope| *scope == Scope::Manage);

        let owner = (thread.owner_id == Some(subject_id)).then_some(Scope::Access);

        Ok([direct, via_groups, implied, owner].into_iter().flatten().max())
    }

    async fn group_scope(
        &self,
        chat_group_id: Uuid,
        groups: &HashSet<Uuid>,
    ) -> StoreResult<Option<Scope>> {
        Ok(self
            .permissions
            .group_grants(chat_group_id)
            .await?
            .into_iter()
            .filter(|grant| groups.contains(&grant.user_group_id))
            .map(|grant| grant.scope)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::MemoryStore, services::membership::StaticMembership};
    use shared::models::{
        ChatGroupType, GroupPermissionGrant, ThreadGroupPermissionGrant, ThreadUserPermissionGrant,
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        membership: Arc<StaticMembership>,
        resolver: PermissionResolver,
        group: Uuid,
        thread: Uuid,
    }

    async fn fixture(owner: Option<Uuid>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let membership = Arc::new(StaticMembership::new());
        let (group, thread) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_group(group, ChatGroupType::Chat).await;
        store.insert_thread(thread, group, owner).await;
        let resolver = PermissionResolver::new(store.clone(), store.clone(), membership.clone());
        Fixture {
            store,
            membership,
            resolver,
            group,
            thread,
        }
    }

    async fn grant_group(f: &Fixture, user_group_id: Uuid, scope: Scope) {
        f.store
            .upsert_group_grant(&GroupPermissionGrant {
                chat_group_id: f.group,
                user_group_id,
                scope,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn group_scope_is_max_over_member_groups() {
        let f = fixture(None).await;
        let (readers, admins, subject) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        f.membership.add_member(readers, subject);
        f.membership.add_member(admins, subject);
        grant_group(&f, readers, Scope::Traverse).await;
        grant_group(&f, admins, Scope::Access).await;

        let scope = f.resolver.resolve(subject, Resource::ChatGroup(f.group)).await.unwrap();
        assert_eq!(scope, Some(Scope::Access));
        assert_eq!(
            f.resolver
                .resolve_group(Uuid::new_v4(), f.group)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn archiving_does_not_change_resolution() {
        let f = fixture(None).await;
        let (managers, subject) = (Uuid::new_v4(), Uuid::new_v4());
        f.membership.add_member(managers, subject);
        grant_group(&f, managers, Scope::Manage).await;
        f.store.archive_thread(f.thread).await;

        assert_eq!(
            f.resolver.resolve_thread(subject, f.thread).await.unwrap(),
            Some(Scope::Manage)
        );
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let f = fixture(None).await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            f.resolver.resolve(Uuid::new_v4(), Resource::ChatGroup(missing)).await,
            Err(EngineError::NotFound { id, .. }) if id == missing
        ));
        assert!(matches!(
            f.resolver.resolve(Uuid::new_v4(), Resource::ChatThread(missing)).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn group_traverse_does_not_reach_threads() {
        let f = fixture(None).await;
        let (browsers, subject) = (Uuid::new_v4(), Uuid::new_v4());
        f.membership.add_member(browsers, subject);
        grant_group(&f, browsers, Scope::Traverse).await;
        grant_group(&f, Uuid::new_v4(), Scope::Manage).await;

        assert_eq!(f.resolver.resolve_thread(subject, f.thread).await.unwrap(), None);
        assert!(!f.resolver.can_read_thread(subject, f.thread).await.unwrap());
    }

    #[tokio::test]
    async fn thread_scope_combines_every_candidate_source() {
        let f = fixture(None).await;
        let (members, managers, subject) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        f.membership.add_member(members, subject);

        f.store
            .upsert_thread_user_grant(&ThreadUserPermissionGrant {
                chat_thread_id: f.thread,
                subject_id: subject,
                scope: Scope::Access,
            })
            .await
            .unwrap();
        assert_eq!(
            f.resolver.resolve_thread(subject, f.thread).await.unwrap(),
            Some(Scope::Access)
        );

        f.store
            .upsert_thread_group_grant(&ThreadGroupPermissionGrant {
                chat_thread_id: f.thread,
                user_group_id: members,
                scope: Scope::Manage,
            })
            .await
            .unwrap();
        assert_eq!(
            f.resolver.resolve_thread(subject, f.thread).await.unwrap(),
            Some(Scope::Manage)
        );

        let manager = Uuid::new_v4();
        f.membership.add_member(managers, manager);
        grant_group(&f, managers, Scope::Manage).await;
        assert_eq!(
            f.resolver.resolve_thread(manager, f.thread).await.unwrap(),
            Some(Scope::Manage)
        );
    }

    #[tokio::test]
    async fn direct_thread_owner_gets_access() {
        let owner = Uuid::new_v4();
        let f = fixture(Some(owner)).await;
        assert_eq!(
            f.resolver.resolve_thread(owner, f.thread).await.unwrap(),
            Some(Scope::Access)
        );
        assert_eq!(
            f.resolver.resolve_thread(Uuid::new_v4(), f.thread).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn membership_outage_hides_group_grants_but_keeps_direct_grants() {
        let f = fixture(None).await;
        let (managers, subject) = (Uuid::new_v4(), Uuid::new_v4());
        f.membership.add_member(managers, subject);
        grant_group(&f, managers, Scope::Manage).await;
        f.membership.set_unavailable(true);

        assert_eq!(f.resolver.resolve_thread(subject, f.thread).await.unwrap(), None);

        f.store
            .upsert_thread_user_grant(&ThreadUserPermissionGrant {
                chat_thread_id: f.thread,
                subject_id: subject,
                scope: Scope::Access,
            })
            .await
            .unwrap();
        assert_eq!(
            f.resolver.resolve_thread(subject, f.thread).await.unwrap(),
            Some(Scope::Access)
        );
    }

    #[tokio::test]
    async fn archived_threads_resolve_like_active_ones() {
        let owner = Uuid::new_v4();
        let f = fixture(Some(owner)).await;
        f.store.archive_thread(f.thread).await;
        assert_eq!(
            f.resolver.resolve_thread(owner, f.thread).await.unwrap(),
            Some(Scope::Access)
        );
    }
}
