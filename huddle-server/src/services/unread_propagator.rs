use std::{collections::BTreeMap, fmt, sync::Arc};

use shared::models::{
    MessageCreatedEvent, ResourceEvent, Topic, UnreadGroupCount, UnreadMarker, UnreadPath,
    UnreadPathKind, unread::UNREAD_PATH_ROOT,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    audience::AudienceCalculator,
    error::{EngineError, EngineResult},
    event_publisher::{EventPublisher, publish_best_effort},
    retry::{RetryPolicy, retry_transient},
};
use crate::db::{ChatDirectory, UnreadStore};

/// Outcome of propagating a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePropagation {
    pub path: UnreadPath,
    /// Subjects now holding a marker for the message, sorted.
    pub recipients: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRemoval {
    pub path: UnreadPath,
    pub removed: u64,
}

/// Maintains unread markers as messages come and go.
///
/// Each subject with a leaf marker under a group also holds the group rollup
/// marker `chat-{group}`; the rollup is pruned once the last leaf is gone.
#[derive(Clone)]
pub struct UnreadPropagator {
    directory: Arc<dyn ChatDirectory>,
    unreads: Arc<dyn UnreadStore>,
    audience: AudienceCalculator,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
}

impl fmt::Debug for UnreadPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnreadPropagator")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl UnreadPropagator {
    pub fn new(
        directory: Arc<dyn ChatDirectory>,
        unreads: Arc<dyn UnreadStore>,
        audience: AudienceCalculator,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            directory,
            unreads,
            audience,
            publisher,
            retry,
        }
    }

    /// Marks the message unread for its audience minus the author.
    /// Idempotent: redelivery of the same message refreshes existing markers.
    #[instrument(name = "unread.message_created", skip(self), err)]
    pub async fn on_message_created(
        &self,
        chat_thread_id: Uuid,
        message_id: Uuid,
        author_id: Uuid,
    ) -> EngineResult<MessagePropagation> {
        let thread = self
            .directory
            .thread(chat_thread_id)
            .await?
            .ok_or_else(|| EngineError::thread_not_found(chat_thread_id))?;

        // The CRUD layer may not have committed the row yet; only a known
        // message can contradict the hook.
        if let Some(message) = self.directory.message(message_id).await? {
            if message.chat_thread_id != thread.id {
                return Err(EngineError::Validation(format!(
                    "message {message_id} belongs to thread {}, not {}",
                    message.chat_thread_id, thread.id
                )));
            }
        }

        let mut audience = self.audience.audience_for_thread(&thread).await?;
        audience.remove(&author_id);
        let mut recipients: Vec<Uuid> = audience.into_iter().collect();
        recipients.sort_unstable();

        let leaf = UnreadPath::leaf(thread.chat_group_id, thread.id, message_id);
        if !recipients.is_empty() {
            let rollup = UnreadPath::group(thread.chat_group_id);
            retry_transient(&self.retry, "unread.upsert_leaf", || {
                self.unreads.upsert_markers(&leaf, &recipients)
            })
            .await?;
            retry_transient(&self.retry, "unread.upsert_rollup", || {
                self.unreads.upsert_markers(&rollup, &recipients)
            })
            .await?;
            metrics::counter!("huddle_unread_markers_created_total")
                .increment(recipients.len() as u64);
        }
        debug!(path = %leaf, recipients = recipients.len(), "propagated message");

        publish_best_effort(
            self.publisher.as_ref(),
            Topic::ChatMessages,
            &MessageCreatedEvent::new(message_id, thread.id, thread.chat_group_id),
        )
        .await;

        Ok(MessagePropagation {
            path: leaf,
            recipients,
        })
    }

    /// Removes the message's markers for every subject, regardless of the
    /// current permission state.
    #[instrument(name = "unread.message_deleted", skip(self), err)]
    pub async fn on_message_deleted(
        &self,
        chat_thread_id: Uuid,
        message_id: Uuid,
    ) -> EngineResult<MessageRemoval> {
        let thread = self
            .directory
            .thread(chat_thread_id)
            .await?
            .ok_or_else(|| EngineError::thread_not_found(chat_thread_id))?;
        let leaf = UnreadPath::leaf(thread.chat_group_id, thread.id, message_id);

        let holders = retry_transient(&self.retry, "unread.leaf_holders", || {
            self.unreads.holders_with_prefix(leaf.as_str())
        })
        .await?;
        let removed =
            retry_transient(&self.retry, "unread.delete_leaf", || self.unreads.delete_path(&leaf))
                .await?;
        for subject_id in holders {
            retry_transient(&self.retry, "unread.prune_rollup", || {
                self.unreads.prune_rollup(subject_id, thread.chat_group_id)
            })
            .await?;
        }
        metrics::counter!("huddle_unread_markers_deleted_total", "reason" => "message_deleted")
            .increment(removed);

        publish_best_effort(
            self.publisher.as_ref(),
            Topic::ChatMessages,
            &ResourceEvent::deleted(message_id),
        )
        .await;

        Ok(MessageRemoval {
            path: leaf,
            removed,
        })
    }

    /// Read acknowledgement: drops the subject's markers under `prefix`.
    #[instrument(name = "unread.acknowledge", skip(self), err)]
    pub async fn acknowledge(&self, subject_id: Uuid, prefix: &str) -> EngineResult<u64> {
        let removed = retry_transient(&self.retry, "unread.acknowledge", || {
            self.unreads.delete_prefix_for_subject(subject_id, prefix)
        })
        .await?;

        if let Some(chat_group_id) = UnreadPath::group_below_prefix(prefix) {
            retry_transient(&self.retry, "unread.prune_rollup", || {
                self.unreads.prune_rollup(subject_id, chat_group_id)
            })
            .await?;
        }

        metrics::counter!("huddle_unread_markers_deleted_total", "reason" => "acknowledged")
            .increment(removed);
        Ok(removed)
    }

    pub async fn list_unreads(
        &self,
        subject_id: Uuid,
        prefix: &str,
    ) -> EngineResult<Vec<UnreadMarker>> {
        Ok(self.unreads.list_for_subject(subject_id, prefix).await?)
    }

    /// Leaf markers per chat group, for badges.
    pub async fn unread_counts(&self, subject_id: Uuid) -> EngineResult<Vec<UnreadGroupCount>> {
        let markers = self
            .unreads
            .list_for_subject(subject_id, UNREAD_PATH_ROOT)
            .await?;

        let mut counts: BTreeMap<Uuid, u64> = BTreeMap::new();
        for marker in markers {
            match UnreadPath::parse(&marker.path) {
                Ok(UnreadPathKind::Leaf { group_id, .. }) => *counts.entry(group_id).or_default() += 1,
                Ok(UnreadPathKind::Group { .. }) => {}
                Err(err) => debug!(error = %err, "skipping foreign unread path"),
            }
        }

        Ok(counts
            .into_iter()
            .map(|(chat_group_id, unread)| UnreadGroupCount {
                chat_group_id,
                unread,
            })
            .collect())
    }
}
