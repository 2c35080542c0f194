//! Activity and message notifications and the unread counters they feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::UserId;

string_id!(
    /// Durable identifier of a notification.
    NotificationId
);

/// What triggered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Reply,
    Comment,
    Follow,
    /// A direct message arrived.
    Message,
    #[serde(other)]
    Other,
}

/// Independent unread counters. Each one is refreshed from its own
/// count-only endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    Messages,
    Activity,
}

impl CounterKind {
    pub const ALL: [CounterKind; 2] = [CounterKind::Messages, CounterKind::Activity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Activity => "activity",
        }
    }

    pub fn for_kind(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::Message => Self::Messages,
            _ => Self::Activity,
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type", alias = "kind")]
    pub kind: NotificationKind,
    pub actor_id: UserId,
    /// Entity the notification is about, e.g. a post id.
    #[serde(default)]
    pub subject_ref: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn counter(&self) -> CounterKind {
        CounterKind::for_kind(self.kind)
    }
}
