use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

/// Notification bus topics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
pub enum Topic {
    #[serde(rename = "chatmessages")]
    ChatMessages,
    #[serde(rename = "chatgroups")]
    ChatGroups,
    #[serde(rename = "chatthreads")]
    ChatThreads,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Self::ChatMessages, Self::ChatGroups, Self::ChatThreads];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessages => "chatmessages",
            Self::ChatGroups => "chatgroups",
            Self::ChatThreads => "chatthreads",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Topic {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim() {
            "chatmessages" => Ok(Self::ChatMessages),
            "chatgroups" => Ok(Self::ChatGroups),
            "chatthreads" => Ok(Self::ChatThreads),
            _ => Err("unknown event topic"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Created,
    Updated,
    Deleted,
}

/// Published on `chatmessages` after unread markers for a new message exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreatedEvent {
    pub operation: Operation,
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub group_id: Uuid,
}

impl MessageCreatedEvent {
    #[must_use]
    pub fn new(message_id: Uuid, thread_id: Uuid, group_id: Uuid) -> Self {
        Self {
            operation: Operation::Created,
            message_id,
            thread_id,
            group_id,
        }
    }
}

/// Id-only payload used for deletions and grant updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEvent {
    pub operation: Operation,
    pub id: Uuid,
}

impl ResourceEvent {
    #[must_use]
    pub fn deleted(id: Uuid) -> Self {
        Self {
            operation: Operation::Deleted,
            id,
        }
    }

    #[must_use]
    pub fn updated(id: Uuid) -> Self {
        Self {
            operation: Operation::Updated,
            id,
        }
    }
}

/// A payload as it travels over the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct EventEnvelope {
    pub topic: Topic,
    #[schema(value_type = Object)]
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_created_payload_shape() {
        let (m, t, g) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let value = serde_json::to_value(MessageCreatedEvent::new(m, t, g)).unwrap();
        assert_eq!(
            value,
            json!({
                "operation": "CREATED",
                "messageId": m,
                "threadId": t,
                "groupId": g,
            })
        );
    }

    #[test]
    fn deleted_payload_carries_only_id() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(ResourceEvent::deleted(id)).unwrap();
        assert_eq!(value, json!({ "operation": "DELETED", "id": id }));
    }

    #[test]
    fn topics_use_bus_names() {
        for topic in Topic::ALL {
            assert_eq!(Topic::try_from(topic.as_str()), Ok(topic));
            assert_eq!(
                serde_json::to_value(topic).unwrap(),
                json!(topic.as_str())
            );
        }
        assert!(Topic::try_from("chatusers").is_err());
    }
}
