use std::{fmt, sync::Arc};

use shared::config::server::ReconcileConfig;

use super::{
    audience::AudienceCalculator,
    event_publisher::EventPublisher,
    grant_service::GrantService,
    membership::GroupMembershipLookup,
    permission_resolver::PermissionResolver,
    reconciler::PermissionChangeReconciler,
    retry::RetryPolicy,
    unread_propagator::UnreadPropagator,
};
use crate::db::{ChatDirectory, PermissionStore, UnreadStore};

/// Collaborators the engine is built from.
#[derive(Clone)]
pub struct EngineDeps {
    pub directory: Arc<dyn ChatDirectory>,
    pub permissions: Arc<dyn PermissionStore>,
    pub unreads: Arc<dyn UnreadStore>,
    pub membership: Arc<dyn GroupMembershipLookup>,
    pub publisher: Arc<dyn EventPublisher>,
}

impl fmt::Debug for EngineDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineDeps").finish_non_exhaustive()
    }
}

impl EngineDeps {
    /// Uses one store for directory, grants and unreads.
    pub fn from_store<S>(
        store: Arc<S>,
        membership: Arc<dyn GroupMembershipLookup>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self
    where
        S: ChatDirectory + PermissionStore + UnreadStore + 'static,
    {
        Self {
            directory: store.clone(),
            permissions: store.clone(),
            unreads: store,
            membership,
            publisher,
        }
    }
}

/// The wired engine: every component shares the same collaborators.
#[derive(Clone)]
pub struct ChatEngine {
    resolver: PermissionResolver,
    audience: AudienceCalculator,
    propagator: UnreadPropagator,
    reconciler: PermissionChangeReconciler,
    grants: GrantService,
}

impl fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatEngine")
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl ChatEngine {
    pub fn new(deps: EngineDeps, config: &ReconcileConfig) -> Self {
        let retry = RetryPolicy::from_config(config);
        let resolver = PermissionResolver::new(
            deps.directory.clone(),
            deps.permissions.clone(),
            deps.membership.clone(),
        );
        let audience = AudienceCalculator::new(
            deps.directory.clone(),
            deps.permissions.clone(),
            deps.membership,
        );
        let propagator = UnreadPropagator::new(
            deps.directory.clone(),
            deps.unreads.clone(),
            audience.clone(),
            deps.publisher.clone(),
            retry,
        );
        let reconciler = PermissionChangeReconciler::new(
            deps.directory.clone(),
            deps.unreads,
            audience.clone(),
            retry,
            config.max_concurrent_passes,
        );
        let grants = GrantService::new(
            deps.directory,
            deps.permissions,
            reconciler.clone(),
            deps.publisher,
        );

        Self {
            resolver,
            audience,
            propagator,
            reconciler,
            grants,
        }
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    pub fn audience(&self) -> &AudienceCalculator {
        &self.audience
    }

    pub fn propagator(&self) -> &UnreadPropagator {
        &self.propagator
    }

    pub fn reconciler(&self) -> &PermissionChangeReconciler {
        &self.reconciler
    }

    pub fn grants(&self) -> &GrantService {
        &self.grants
    }
}
