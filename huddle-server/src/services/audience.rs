use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    sync::Arc,
};

use futures::future::{join_all, try_join_all};
use shared::models::{ChatThread, Scope};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    error::{EngineError, EngineResult},
    membership::{GroupMembershipLookup, members_or_empty},
};
use crate::db::{ChatDirectory, PermissionStore};

/// Expands the grants on a thread into the set of subjects who may read it.
///
/// Cost is proportional to the grants on the thread and its parent group; the
/// user population is never enumerated.
#[derive(Clone)]
pub struct AudienceCalculator {
    directory: Arc<dyn ChatDirectory>,
    permissions: Arc<dyn PermissionStore>,
    membership: Arc<dyn GroupMembershipLookup>,
}

impl fmt::Debug for AudienceCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudienceCalculator").finish()
    }
}

impl AudienceCalculator {
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

    #[instrument(name = "audience.for_thread", skip(self), err)]
    pub async fn audience_for(&self, chat_thread_id: Uuid) -> EngineResult<HashSet<Uuid>> {
        let thread = self
            .directory
            .thread(chat_thread_id)
            .await?
            .ok_or_else(|| EngineError::thread_not_found(chat_thread_id))?;
        self.audience_for_thread(&thread).await
    }

    /// Audience for read paths: a failed member lookup counts as an empty
    /// user group, which can only under-deliver.
    pub async fn audience_for_thread(&self, thread: &ChatThread) -> EngineResult<HashSet<Uuid>> {
        let (mut audience, user_groups) = self.grant_holders(thread).await?;
        let member_sets = join_all(
            user_groups
                .iter()
                .map(|group| members_or_empty(self.membership.as_ref(), *group)),
        )
        .await;
        audience.extend(member_sets.into_iter().flatten());
        Self::finish(thread, audience, user_groups.len())
    }

    /// Audience for destructive passes. A failed member lookup is returned as
    /// [`EngineError::Membership`] instead of shrinking the audience.
    pub async fn strict_audience_for_thread(
        &self,
        thread: &ChatThread,
    ) -> EngineResult<HashSet<Uuid>> {
        let (mut audience, user_groups) = self.grant_holders(thread).await?;
        let member_sets = try_join_all(
            user_groups
                .iter()
                .map(|group| self.membership.members_of(*group)),
        )
        .await?;
        audience.extend(member_sets.into_iter().flatten());
        Self::finish(thread, audience, user_groups.len())
    }

    /// Direct readers and the user groups whose members may read the thread.
    async fn grant_holders(
        &self,
        thread: &ChatThread,
    ) -> EngineResult<(HashSet<Uuid>, BTreeSet<Uuid>)> {
        let direct: HashSet<Uuid> = self
            .permissions
            .thread_user_grants(thread.id)
            .await?
            .into_iter()
            .filter(|grant| grant.scope.grants_read())
            .map(|grant| grant.subject_id)
            .collect();

        let mut user_groups: BTreeSet<Uuid> = self
            .permissions
            .thread_group_grants(thread.id)
            .await?
            .into_iter()
            .filter(|grant| grant.scope.grants_read())
            .map(|grant| grant.user_group_id)
            .collect();

        user_groups.extend(
            self.permissions
                .group_grants(thread.chat_group_id)
                .await?
                .into_iter()
                .filter(|grant| grant.scope == Scope::Manage)
                .map(|grant| grant.user_group_id),
        );
        Ok((direct, user_groups))
    }

    fn finish(
        thread: &ChatThread,
        mut audience: HashSet<Uuid>,
        user_groups: usize,
    ) -> EngineResult<HashSet<Uuid>> {
        if let Some(owner) = thread.owner_id {
            audience.insert(owner);
        }
        debug!(
            thread_id = %thread.id,
            user_groups,
            subjects = audience.len(),
            "computed thread audience"
        );
        Ok(audience)
    }
}
