//! Unread markers and the hierarchical path keys that index them.
//!
//! A marker path flattens the `group → thread → message` hierarchy into one
//! string so "everything unread under this group" is a prefix scan:
//!
//! * `chat-{groupId}` is the per-subject group rollup used for badges.
//! * `chat-{groupId}-{threadId}-{messageId}` is one unseen message.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

pub const UNREAD_PATH_ROOT: &str = "chat-";

const UUID_LEN: usize = 36;
const GROUP_PATH_LEN: usize = UNREAD_PATH_ROOT.len() + UUID_LEN;
const LEAF_PATH_LEN: usize = GROUP_PATH_LEN + 2 * (UUID_LEN + 1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("malformed unread path '{0}'")]
    Malformed(String),
    #[error("wildcard is only allowed as the final character of '{0}'")]
    WildcardPosition(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnreadPath(String);

/// Decoded form of an [`UnreadPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadPathKind {
    Group {
        group_id: Uuid,
    },
    Leaf {
        group_id: Uuid,
        thread_id: Uuid,
        message_id: Uuid,
    },
}

impl UnreadPath {
    #[must_use]
    pub fn group(group_id: Uuid) -> Self {
        Self(format!("{UNREAD_PATH_ROOT}{group_id}"))
    }

    #[must_use]
    pub fn leaf(group_id: Uuid, thread_id: Uuid, message_id: Uuid) -> Self {
        Self(format!(
            "{UNREAD_PATH_ROOT}{group_id}-{thread_id}-{message_id}"
        ))
    }

    /// Prefix matching every leaf marker of one thread.
    #[must_use]
    pub fn thread_prefix(group_id: Uuid, thread_id: Uuid) -> String {
        format!("{UNREAD_PATH_ROOT}{group_id}-{thread_id}-")
    }

    /// Prefix matching every leaf marker of one group, excluding its rollup.
    #[must_use]
    pub fn group_leaf_prefix(group_id: Uuid) -> String {
        format!("{UNREAD_PATH_ROOT}{group_id}-")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Decodes a stored path.
    ///
    /// # Errors
    /// Returns [`PathError::Malformed`] when the path is neither a group
    /// rollup nor a leaf.
    pub fn parse(raw: &str) -> Result<UnreadPathKind, PathError> {
        let malformed = || PathError::Malformed(raw.to_string());
        if !raw.starts_with(UNREAD_PATH_ROOT) {
            return Err(malformed());
        }

        let group_id = parse_uuid_at(raw, UNREAD_PATH_ROOT.len()).ok_or_else(malformed)?;
        match raw.len() {
            GROUP_PATH_LEN => Ok(UnreadPathKind::Group { group_id }),
            LEAF_PATH_LEN => {
                let thread_start = GROUP_PATH_LEN + 1;
                let message_start = thread_start + UUID_LEN + 1;
                if raw.as_bytes()[GROUP_PATH_LEN] != b'-'
                    || raw.as_bytes()[message_start - 1] != b'-'
                {
                    return Err(malformed());
                }
                let thread_id = parse_uuid_at(raw, thread_start).ok_or_else(malformed)?;
                let message_id = parse_uuid_at(raw, message_start).ok_or_else(malformed)?;
                Ok(UnreadPathKind::Leaf {
                    group_id,
                    thread_id,
                    message_id,
                })
            }
            _ => Err(malformed()),
        }
    }

    /// Group a prefix is scoped to, when the prefix reaches past the group
    /// rollup into its leaves (`chat-{g}-...`).
    #[must_use]
    pub fn group_below_prefix(prefix: &str) -> Option<Uuid> {
        if prefix.len() <= GROUP_PATH_LEN || !prefix.starts_with(UNREAD_PATH_ROOT) {
            return None;
        }
        parse_uuid_at(prefix, UNREAD_PATH_ROOT.len())
    }
}

impl fmt::Display for UnreadPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UnreadPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn parse_uuid_at(raw: &str, start: usize) -> Option<Uuid> {
    raw.get(start..start + UUID_LEN)
        .and_then(|segment| Uuid::parse_str(segment).ok())
}

/// Converts a REST "path-like" filter (`chat-{groupId}%`) into a literal
/// prefix. Only one trailing `%` is accepted.
///
/// # Errors
/// Returns [`PathError::WildcardPosition`] when `%` appears anywhere but at
/// the end.
pub fn normalize_path_like(raw: &str) -> Result<String, PathError> {
    let trimmed = raw.trim();
    let prefix = trimmed.strip_suffix('%').unwrap_or(trimmed);
    if prefix.contains('%') {
        return Err(PathError::WildcardPosition(raw.to_string()));
    }
    Ok(prefix.to_string())
}

/// A per-subject record of unseen content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnreadMarker {
    pub path: String,
    pub subject_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnreadListResponse {
    pub unreads: Vec<UnreadMarker>,
}

/// Badge count of unseen messages under one chat group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnreadGroupCount {
    pub chat_group_id: Uuid,
    pub unread: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountsResponse {
    pub groups: Vec<UnreadGroupCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnreadAcknowledgedResponse {
    pub removed: u64,
}
