use std::{
    fmt,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use shared::models::{EventEnvelope, Topic};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{trace, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode {topic} payload: {source}")]
    Encode {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// Topic-based notification bus. Delivery is best-effort and at-least-once;
/// subscribers must tolerate duplicates.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: Topic, payload: Value) -> Result<(), PublishError>;
}

/// Publishes `payload`, logging and counting any failure instead of
/// returning it. The data mutation that triggered the event stands either way.
pub async fn publish_best_effort<P>(publisher: &dyn EventPublisher, topic: Topic, payload: &P)
where
    P: Serialize + ?Sized,
{
    let result = match serde_json::to_value(payload) {
        Ok(value) => publisher.publish(topic, value).await,
        Err(source) => Err(PublishError::Encode { topic, source }),
    };

    if let Err(err) = result {
        warn!(topic = %topic, error = %err, "dropping event after publish failure");
        metrics::counter!("huddle_publish_failures_total", "topic" => topic.as_str()).increment(1);
    } else {
        metrics::counter!("huddle_events_published_total", "topic" => topic.as_str()).increment(1);
    }
}

/// In-process fan-out feeding the SSE endpoint.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<EventEnvelope>,
}

impl fmt::Debug for BroadcastPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastPublisher")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, topic: Topic, payload: Value) -> Result<(), PublishError> {
        // A send error only means nobody is listening right now.
        let delivered = self
            .sender
            .send(EventEnvelope { topic, payload })
            .unwrap_or(0);
        trace!(topic = %topic, delivered, "broadcast event");
        Ok(())
    }
}

/// Captures every published event; can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<EventEnvelope>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_for(&self, topic: Topic) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|event| event.topic == topic)
            .map(|event| event.payload)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: Topic, payload: Value) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("recording publisher offline".into()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(EventEnvelope { topic, payload });
        Ok(())
    }
}
