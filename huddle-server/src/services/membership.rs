//! User-group membership as published by the identity provider.
//!
//! The engine only ever expands grant rows into member sets, so lookups are
//! keyed by subject (`groups_of`) or by user group (`members_of`). A failing
//! lookup degrades to "no membership", which can only hide content.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{trace, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("membership lookup unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for MembershipError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait GroupMembershipLookup: Send + Sync {
    async fn groups_of(&self, subject_id: Uuid) -> Result<HashSet<Uuid>, MembershipError>;
    async fn members_of(&self, user_group_id: Uuid) -> Result<HashSet<Uuid>, MembershipError>;
}

pub async fn groups_or_empty(lookup: &dyn GroupMembershipLookup, subject_id: Uuid) -> HashSet<Uuid> {
    match lookup.groups_of(subject_id).await {
        Ok(groups) => groups,
        Err(err) => {
            warn!(subject_id = %subject_id, error = %err, "treating subject as member of no groups");
            metrics::counter!("huddle_membership_failures_total", "lookup" => "groups_of")
                .increment(1);
            HashSet::new()
        }
    }
}

pub async fn members_or_empty(
    lookup: &dyn GroupMembershipLookup,
    user_group_id: Uuid,
) -> HashSet<Uuid> {
    match lookup.members_of(user_group_id).await {
        Ok(members) => members,
        Err(err) => {
            warn!(user_group_id = %user_group_id, error = %err, "treating user group as empty");
            metrics::counter!("huddle_membership_failures_total", "lookup" => "members_of")
                .increment(1);
            HashSet::new()
        }
    }
}

/// Membership held in memory. Used by tests and the in-memory server mode.
#[derive(Debug, Default)]
pub struct StaticMembership {
    members: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    unavailable: AtomicBool,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, user_group_id: Uuid, subject_id: Uuid) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_group_id)
            .or_default()
            .insert(subject_id);
    }

    pub fn remove_member(&self, user_group_id: Uuid, subject_id: Uuid) {
        if let Some(members) = self
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&user_group_id)
        {
            members.remove(&subject_id);
        }
    }

    /// Simulates an identity provider outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), MembershipError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(MembershipError::Unavailable("static membership offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GroupMembershipLookup for StaticMembership {
    async fn groups_of(&self, subject_id: Uuid) -> Result<HashSet<Uuid>, MembershipError> {
        self.check_available()?;
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        Ok(members
            .iter()
            .filter(|(_, subjects)| subjects.contains(&subject_id))
            .map(|(group, _)| *group)
            .collect())
    }

    async fn members_of(&self, user_group_id: Uuid) -> Result<HashSet<Uuid>, MembershipError> {
        self.check_available()?;
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        Ok(members.get(&user_group_id).cloned().unwrap_or_default())
    }
}

/// Reads the `user_group_members` mirror of the identity provider.
#[derive(Clone)]
pub struct PgMembership {
    pool: PgPool,
}

impl fmt::Debug for PgMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgMembership").finish()
    }
}

impl PgMembership {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupMembershipLookup for PgMembership {
    async fn groups_of(&self, subject_id: Uuid) -> Result<HashSet<Uuid>, MembershipError> {
        let groups = sqlx::query_scalar::<_, Uuid>(
            "SELECT user_group_id FROM huddle.user_group_members WHERE subject_id = $1",
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(groups.into_iter().collect())
    }

    async fn members_of(&self, user_group_id: Uuid) -> Result<HashSet<Uuid>, MembershipError> {
        let members = sqlx::query_scalar::<_, Uuid>(
            "SELECT subject_id FROM huddle.user_group_members WHERE user_group_id = $1",
        )
        .bind(user_group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members.into_iter().collect())
    }
}

#[derive(Debug, Default)]
struct TtlCache {
    entries: Mutex<HashMap<Uuid, (Instant, HashSet<Uuid>)>>,
}

impl TtlCache {
    fn get(&self, key: Uuid, ttl: Duration) -> Option<HashSet<Uuid>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&key)
            .filter(|(stored_at, _)| stored_at.elapsed() < ttl)
            .map(|(_, value)| value.clone())
    }

    fn put(&self, key: Uuid, value: HashSet<Uuid>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (Instant::now(), value));
    }

    fn remove(&self, key: Uuid) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }
}

/// Short-TTL cache in front of another lookup. Errors are never cached.
pub struct CachedMembership<L> {
    inner: L,
    ttl: Duration,
    groups: TtlCache,
    members: TtlCache,
}

impl<L> fmt::Debug for CachedMembership<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedMembership")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<L: GroupMembershipLookup> CachedMembership<L> {
    pub fn new(inner: L, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            groups: TtlCache::default(),
            members: TtlCache::default(),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn invalidate_subject(&self, subject_id: Uuid) {
        self.groups.remove(subject_id);
    }

    pub fn invalidate_group(&self, user_group_id: Uuid) {
        self.members.remove(user_group_id);
    }
}

#[async_trait]
impl<L: GroupMembershipLookup> GroupMembershipLookup for CachedMembership<L> {
    async fn groups_of(&self, subject_id: Uuid) -> Result<HashSet<Uuid>, MembershipError> {
        if let Some(hit) = self.groups.get(subject_id, self.ttl) {
            trace!(subject_id = %subject_id, "membership cache hit");
            return Ok(hit);
        }
        let groups = self.inner.groups_of(subject_id).await?;
        if !self.ttl.is_zero() {
            self.groups.put(subject_id, groups.clone());
        }
        Ok(groups)
    }

    async fn members_of(&self, user_group_id: Uuid) -> Result<HashSet<Uuid>, MembershipError> {
        if let Some(hit) = self.members.get(user_group_id, self.ttl) {
            return Ok(hit);
        }
        let members = self.inner.members_of(user_group_id).await?;
        if !self.ttl.is_zero() {
            self.members.put(user_group_id, members.clone());
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_membership_answers_both_directions() {
        let membership = StaticMembership::new();
        let (group, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        membership.add_member(group, alice);
        membership.add_member(group, bob);
        membership.remove_member(group, bob);

        assert_eq!(
            membership.groups_of(alice).await.unwrap(),
            HashSet::from([group])
        );
        assert!(membership.groups_of(bob).await.unwrap().is_empty());
        assert_eq!(
            membership.members_of(group).await.unwrap(),
            HashSet::from([alice])
        );
    }

    #[tokio::test]
    async fn unavailable_lookup_degrades_to_empty_sets() {
        let membership = StaticMembership::new();
        let (group, alice) = (Uuid::new_v4(), Uuid::new_v4());
        membership.add_member(group, alice);
        membership.set_unavailable(true);

        assert!(membership.groups_of(alice).await.is_err());
        assert!(groups_or_empty(&membership, alice).await.is_empty());
        assert!(members_or_empty(&membership, group).await.is_empty());
    }

    #[tokio::test]
    async fn cache_serves_stale_sets_until_invalidated() {
        let (group, alice) = (Uuid::new_v4(), Uuid::new_v4());
        let cached = CachedMembership::new(StaticMembership::new(), Duration::from_secs(60));
        cached.inner().add_member(group, alice);

        assert_eq!(cached.members_of(group).await.unwrap().len(), 1);
        cached.inner().remove_member(group, alice);
        assert_eq!(cached.members_of(group).await.unwrap().len(), 1);

        cached.invalidate_group(group);
        assert!(cached.members_of(group).await.unwrap().is_empty());

        let other = Uuid::new_v4();
        cached.inner().add_member(group, alice);
        assert_eq!(cached.groups_of(alice).await.unwrap(), HashSet::from([group]));
        cached.inner().add_member(other, alice);
        assert_eq!(cached.groups_of(alice).await.unwrap().len(), 1);

        cached.invalidate_subject(alice);
        assert_eq!(
            cached.groups_of(alice).await.unwrap(),
            HashSet::from([group, other])
        );
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching_and_errors_are_not_cached() {
        let (group, alice) = (Uuid::new_v4(), Uuid::new_v4());
        let cached = CachedMembership::new(StaticMembership::new(), Duration::from_secs(60));
        cached.inner().add_member(group, alice);

        cached.inner().set_unavailable(true);
        assert!(cached.groups_of(alice).await.is_err());
        cached.inner().set_unavailable(false);
        assert_eq!(cached.groups_of(alice).await.unwrap(), HashSet::from([group]));

        let uncached = CachedMembership::new(StaticMembership::new(), Duration::ZERO);
        uncached.inner().add_member(group, alice);
        assert_eq!(uncached.groups_of(alice).await.unwrap().len(), 1);
        uncached.inner().remove_member(group, alice);
        assert!(uncached.groups_of(alice).await.unwrap().is_empty());
    }
}
