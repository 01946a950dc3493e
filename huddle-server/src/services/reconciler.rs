//! Background convergence of the unread index after permission changes.
//!
//! Passes are keyed by [`ReconcileTarget`] and never run twice at once for the
//! same key: a trigger that arrives while a pass is running flags exactly one
//! rerun, which starts from scratch once the current pass ends.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use shared::models::UnreadPath;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    audience::AudienceCalculator,
    error::EngineResult,
    retry::{RetryPolicy, retry_transient},
};
use crate::db::{ChatDirectory, UnreadStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileTarget {
    /// Every thread under the chat group.
    Group(Uuid),
    Thread(Uuid),
}

impl fmt::Display for ReconcileTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(id) => write!(f, "group:{id}"),
            Self::Thread(id) => write!(f, "thread:{id}"),
        }
    }
}

#[derive(Debug, Default)]
struct JobState {
    rerun: bool,
}

struct ReconcilerInner {
    directory: Arc<dyn ChatDirectory>,
    unreads: Arc<dyn UnreadStore>,
    audience: AudienceCalculator,
    retry: RetryPolicy,
    jobs: Mutex<HashMap<ReconcileTarget, JobState>>,
    /// Targets queued or running.
    pending: watch::Sender<usize>,
    completed: AtomicU64,
    permits: Semaphore,
}

#[derive(Clone)]
pub struct PermissionChangeReconciler {
    inner: Arc<ReconcilerInner>,
}

impl fmt::Debug for PermissionChangeReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionChangeReconciler")
            .field("pending", &self.pending())
            .field("completed_passes", &self.completed_passes())
            .finish_non_exhaustive()
    }
}

impl PermissionChangeReconciler {
    pub fn new(
        directory: Arc<dyn ChatDirectory>,
        unreads: Arc<dyn UnreadStore>,
        audience: AudienceCalculator,
        retry: RetryPolicy,
        max_concurrent_passes: usize,
    ) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(ReconcilerInner {
                directory,
                unreads,
                audience,
                retry,
                jobs: Mutex::new(HashMap::new()),
                pending,
                completed: AtomicU64::new(0),
                permits: Semaphore::new(max_concurrent_passes.max(1)),
            }),
        }
    }

    /// Schedules a pass for `target` and returns immediately.
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, target: ReconcileTarget) {
        self.inner.enqueue(target);
    }

    /// Resolves once no pass is queued or running.
    pub async fn settled(&self) {
        let mut receiver = self.inner.pending.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|pending| *pending == 0).await;
    }

    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Passes finished since start-up, successful or not.
    pub fn completed_passes(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Enqueues every chat group.
    pub async fn sweep(&self) -> EngineResult<usize> {
        let groups = retry_transient(&self.inner.retry, "reconcile.sweep", || {
            self.inner.directory.group_ids()
        })
        .await?;
        for group_id in &groups {
            self.enqueue(ReconcileTarget::Group(*group_id));
        }
        info!(groups = groups.len(), "periodic reconciliation sweep enqueued");
        Ok(groups.len())
    }

    /// Runs [`Self::sweep`] every `interval` until `shutdown` fires.
    pub fn spawn_sweep(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = reconciler.sweep().await {
                            warn!(error = %err, "reconciliation sweep failed");
                        }
                    }
                }
            }
            debug!("reconciliation sweep stopped");
        })
    }
}

impl ReconcilerInner {
    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<ReconcileTarget, JobState>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(self: &Arc<Self>, target: ReconcileTarget) {
        {
            let mut jobs = self.lock_jobs();
            if let Some(job) = jobs.get_mut(&target) {
                job.rerun = true;
                debug!(target = %target, "reconciliation already scheduled; coalesced");
                return;
            }
            jobs.insert(target, JobState::default());
        }

        self.pending.send_modify(|pending| *pending += 1);
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drive(target).await });
    }

    async fn drive(self: Arc<Self>, target: ReconcileTarget) {
        loop {
            self.run_pass(target).await;

            let rerun = {
                let mut jobs = self.lock_jobs();
                match jobs.get_mut(&target) {
                    Some(job) if job.rerun => {
                        job.rerun = false;
                        true
                    }
                    _ => {
                        jobs.remove(&target);
                        false
                    }
                }
            };
            if !rerun {
                break;
            }
        }
        self.pending
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }

    async fn run_pass(self: &Arc<Self>, target: ReconcileTarget) {
        let _permit = self.permits.acquire().await.ok();
        let started = Instant::now();

        let outcome = match target {
            ReconcileTarget::Group(group_id) => self.expand_group(group_id).await,
            ReconcileTarget::Thread(thread_id) => {
                retry_transient(&self.retry, "reconcile.thread", || {
                    self.reconcile_thread(thread_id)
                })
                .await
            }
        };

        let label = match &outcome {
            Ok(_) => "ok",
            Err(err) => {
                warn!(target = %target, error = %err, "reconciliation pass failed");
                "error"
            }
        };
        metrics::counter!("huddle_reconcile_passes_total", "outcome" => label).increment(1);
        metrics::histogram!("huddle_reconcile_pass_seconds").record(started.elapsed().as_secs_f64());
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    async fn expand_group(self: &Arc<Self>, group_id: Uuid) -> EngineResult<usize> {
        let threads = retry_transient(&self.retry, "reconcile.group_threads", || {
            self.directory.threads_in_group(group_id)
        })
        .await?;
        for thread in &threads {
            self.enqueue(ReconcileTarget::Thread(thread.id));
        }
        debug!(group_id = %group_id, threads = threads.len(), "expanded group reconciliation");
        Ok(threads.len())
    }

    /// Drops every leaf marker of the thread held by a subject who is no longer
    /// in its audience. Subjects gaining access get nothing retroactively.
    #[instrument(name = "reconcile.thread", skip(self), err)]
    async fn reconcile_thread(&self, thread_id: Uuid) -> EngineResult<usize> {
        let Some(thread) = self.directory.thread(thread_id).await? else {
            debug!(thread_id = %thread_id, "thread vanished before reconciliation");
            return Ok(0);
        };

        // A membership outage must fail the pass, not empty the audience.
        let audience = self.audience.strict_audience_for_thread(&thread).await?;
        let prefix = UnreadPath::thread_prefix(thread.chat_group_id, thread.id);
        let holders = self.unreads.holders_with_prefix(&prefix).await?;

        let mut revoked = 0;
        for subject_id in holders.difference(&audience) {
            let removed = self
                .unreads
                .delete_prefix_for_subject(*subject_id, &prefix)
                .await?;
            self.unreads
                .prune_rollup(*subject_id, thread.chat_group_id)
                .await?;
            metrics::counter!("huddle_unread_markers_deleted_total", "reason" => "revoked")
                .increment(removed);
            revoked += 1;
        }

        if revoked > 0 {
            info!(thread_id = %thread_id, revoked, "removed unread markers after access change");
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{MemoryStore, PermissionStore, StoreResult},
        services::membership::StaticMembership,
    };
    use async_trait::async_trait;
    use shared::models::{
        ChatGroupType, Scope, ThreadGroupPermissionGrant, ThreadUserPermissionGrant, UnreadMarker,
    };
    use std::{collections::HashSet, sync::atomic::AtomicUsize};

    struct Fixture {
        store: Arc<MemoryStore>,
        membership: Arc<StaticMembership>,
        reconciler: PermissionChangeReconciler,
        group: Uuid,
        thread: Uuid,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let membership = Arc::new(StaticMembership::new());
        let (group, thread) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_group(group, ChatGroupType::Chat).await;
        store.insert_thread(thread, group, None).await;

        let audience = AudienceCalculator::new(store.clone(), store.clone(), membership.clone());
        let reconciler =
            PermissionChangeReconciler::new(store.clone(), store.clone(), audience, fast_retry(), 4);
        Fixture {
            store,
            membership,
            reconciler,
            group,
            thread,
        }
    }

    async fn mark(f: &Fixture, subject: Uuid) -> UnreadPath {
        let leaf = UnreadPath::leaf(f.group, f.thread, Uuid::new_v4());
        f.store.upsert_markers(&leaf, &[subject]).await.unwrap();
        f.store
            .upsert_markers(&UnreadPath::group(f.group), &[subject])
            .await
            .unwrap();
        leaf
    }

    /// Delegates to a [`MemoryStore`] and records how many
    /// `holders_with_prefix` calls run at once for the same prefix.
    struct OverlapTracker {
        inner: Arc<MemoryStore>,
        in_flight: Mutex<HashMap<String, usize>>,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl OverlapTracker {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                in_flight: Mutex::new(HashMap::new()),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl UnreadStore for OverlapTracker {
        async fn upsert_markers(&self, path: &UnreadPath, subjects: &[Uuid]) -> StoreResult<u64> {
            self.inner.upsert_markers(path, subjects).await
        }

        async fn delete_path(&self, path: &UnreadPath) -> StoreResult<u64> {
            self.inner.delete_path(path).await
        }

        async fn delete_prefix_for_subject(&self, subject_id: Uuid, prefix: &str) -> StoreResult<u64> {
            self.inner.delete_prefix_for_subject(subject_id, prefix).await
        }

        async fn holders_with_prefix(&self, prefix: &str) -> StoreResult<HashSet<Uuid>> {
            let running = {
                let mut in_flight = self.in_flight.lock().unwrap();
                let entry = in_flight.entry(prefix.to_string()).or_default();
                *entry += 1;
                *entry
            };
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            let holders = self.inner.holders_with_prefix(prefix).await;
            if let Some(entry) = self.in_flight.lock().unwrap().get_mut(prefix) {
                *entry -= 1;
            }
            holders
        }

        async fn list_for_subject(
            &self,
            subject_id: Uuid,
            prefix: &str,
        ) -> StoreResult<Vec<UnreadMarker>> {
            self.inner.list_for_subject(subject_id, prefix).await
        }

        async fn count_for_subject(&self, subject_id: Uuid, prefix: &str) -> StoreResult<u64> {
            self.inner.count_for_subject(subject_id, prefix).await
        }

        async fn prune_rollup(&self, subject_id: Uuid, chat_group_id: Uuid) -> StoreResult<bool> {
            self.inner.prune_rollup(subject_id, chat_group_id).await
        }
    }

    #[tokio::test]
    async fn revoked_subjects_lose_thread_markers_and_rollup() {
        let f = fixture().await;
        let (kept, revoked) = (Uuid::new_v4(), Uuid::new_v4());
        f.store
            .upsert_thread_user_grant(&ThreadUserPermissionGrant {
                chat_thread_id: f.thread,
                subject_id: kept,
                scope: Scope::Access,
            })
            .await
            .unwrap();
        mark(&f, kept).await;
        mark(&f, revoked).await;

        f.reconciler.enqueue(ReconcileTarget::Thread(f.thread));
        f.reconciler.settled().await;

        assert_eq!(f.store.count_for_subject(revoked, "").await.unwrap(), 0);
        assert_eq!(f.store.count_for_subject(kept, "").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn membership_outage_fails_the_pass_instead_of_revoking() {
        let f = fixture().await;
        let (readers, reader, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        f.membership.add_member(readers, reader);
        f.store
            .upsert_thread_group_grant(&ThreadGroupPermissionGrant {
                chat_thread_id: f.thread,
                user_group_id: readers,
                scope: Scope::Access,
            })
            .await
            .unwrap();
        mark(&f, reader).await;
        mark(&f, reader).await;
        mark(&f, outsider).await;
        let before = f.store.count_for_subject(reader, "").await.unwrap();
        assert_eq!(before, 3);

        f.membership.set_unavailable(true);
        f.reconciler.sweep().await.unwrap();
        f.reconciler.settled().await;

        assert_eq!(f.store.count_for_subject(reader, "").await.unwrap(), before);
        assert_eq!(f.store.count_for_subject(outsider, "").await.unwrap(), 2);

        f.membership.set_unavailable(false);
        f.reconciler.sweep().await.unwrap();
        f.reconciler.settled().await;

        assert_eq!(f.store.count_for_subject(reader, "").await.unwrap(), before);
        assert_eq!(f.store.count_for_subject(outsider, "").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn group_targets_fan_out_to_threads() {
        let f = fixture().await;
        let second_thread = Uuid::new_v4();
        f.store.insert_thread(second_thread, f.group, None).await;
        let subject = Uuid::new_v4();
        mark(&f, subject).await;
        f.store
            .upsert_markers(
                &UnreadPath::leaf(f.group, second_thread, Uuid::new_v4()),
                &[subject],
            )
            .await
            .unwrap();

        f.reconciler.enqueue(ReconcileTarget::Group(f.group));
        f.reconciler.settled().await;

        assert_eq!(f.store.marker_count().await, 0);
        assert_eq!(f.reconciler.completed_passes(), 3);
        assert_eq!(f.reconciler.pending(), 0);
    }

    #[tokio::test]
    async fn vanished_thread_is_a_successful_no_op() {
        let f = fixture().await;
        let subject = Uuid::new_v4();
        mark(&f, subject).await;
        f.store.remove_thread(f.thread).await;

        f.reconciler.enqueue(ReconcileTarget::Thread(f.thread));
        f.reconciler.settled().await;

        assert_eq!(f.reconciler.completed_passes(), 1);
        assert_eq!(f.store.count_for_subject(subject, "").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn transient_failures_inside_a_pass_are_retried() {
        let f = fixture().await;
        let subject = Uuid::new_v4();
        mark(&f, subject).await;
        f.store.fail_unread_writes(1);

        f.reconciler.enqueue(ReconcileTarget::Thread(f.thread));
        f.reconciler.settled().await;

        assert_eq!(f.store.marker_count().await, 0);
    }

    #[tokio::test]
    async fn bursts_for_one_target_coalesce() {
        let f = fixture().await;
        for _ in 0..10 {
            f.reconciler.enqueue(ReconcileTarget::Thread(f.thread));
        }
        f.reconciler.settled().await;

        let passes = f.reconciler.completed_passes();
        assert!((1..=2).contains(&passes), "ran {passes} passes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn passes_for_one_thread_never_overlap() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(OverlapTracker::new(store.clone()));
        let (group, thread) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_group(group, ChatGroupType::Chat).await;
        store.insert_thread(thread, group, None).await;
        let membership = Arc::new(StaticMembership::new());
        let audience = AudienceCalculator::new(store.clone(), store.clone(), membership);
        let reconciler =
            PermissionChangeReconciler::new(store.clone(), tracker.clone(), audience, fast_retry(), 4);

        for _ in 0..20 {
            reconciler.enqueue(ReconcileTarget::Group(group));
            reconciler.enqueue(ReconcileTarget::Thread(thread));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        reconciler.settled().await;

        assert!(tracker.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(tracker.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settled_returns_immediately_when_idle() {
        let f = fixture().await;
        f.reconciler.settled().await;
        assert_eq!(f.reconciler.completed_passes(), 0);
    }

    #[tokio::test]
    async fn sweep_enqueues_every_group() {
        let f = fixture().await;
        let subject = Uuid::new_v4();
        mark(&f, subject).await;

        assert_eq!(f.reconciler.sweep().await.unwrap(), 1);
        f.reconciler.settled().await;
        assert_eq!(f.store.marker_count().await, 0);
    }

    #[tokio::test]
    async fn spawned_sweep_stops_on_shutdown() {
        let f = fixture().await;
        let shutdown = CancellationToken::new();
        let handle = f
            .reconciler
            .spawn_sweep(Duration::from_millis(5), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        handle.await.unwrap();
        f.reconciler.settled().await;
        assert!(f.reconciler.completed_passes() >= 2);
    }
}
