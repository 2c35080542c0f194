//! Conversation, message and notification models shared by the Mercato engine
//! and the gateways it talks to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a server-assigned string identifier.
///
/// The backend emits numeric primary keys for some resources and strings for
/// others, so decoding accepts both.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::std::result::Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                #[derive(::serde::Deserialize)]
                #[serde(untagged)]
                enum Raw {
                    Text(String),
                    Number(i64),
                }

                Ok(match <Raw as ::serde::Deserialize>::deserialize(deserializer)? {
                    Raw::Text(id) => Self(id),
                    Raw::Number(id) => Self(id.to_string()),
                })
            }
        }
    };
}

pub mod notification;
pub mod wire;

pub use notification::{CounterKind, Notification, NotificationId, NotificationKind};

string_id!(
    /// Identifier of a marketplace participant (buyer, seller, agent or admin).
    UserId
);

string_id!(
    /// Durable identifier assigned to a conversation by the backend.
    ConversationId
);

string_id!(
    /// Durable identifier assigned to a message by the backend.
    MessageId
);

/// Client-side correlation token for a message that the backend has not
/// confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalEchoId(pub Uuid);

impl LocalEchoId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalEchoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalEchoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unordered pair of participants. `{a, b}` and `{b, a}` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    low: UserId,
    high: UserId,
}

impl ParticipantPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }
}

/// A two-party conversation.
///
/// `id` stays `None` while the conversation is only an intent between two
/// participants; the backend assigns it when the first message is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub id: Option<ConversationId>,
    pub participant_a: UserId,
    pub participant_b: UserId,
}

impl Conversation {
    /// Creates a pending intent between two participants.
    pub fn pending(participant_a: UserId, participant_b: UserId) -> Self {
        Self {
            id: None,
            participant_a,
            participant_b,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    pub fn pair(&self) -> ParticipantPair {
        ParticipantPair::new(self.participant_a.clone(), self.participant_b.clone())
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.participant_a == user || &self.participant_b == user
    }

    /// Returns the participant that is not `user`.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if &self.participant_a == user {
            Some(&self.participant_b)
        } else if &self.participant_b == user {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    /// Identity comparison: durable ids when both sides have one, the
    /// unordered participant pair otherwise.
    pub fn same_identity(&self, other: &Conversation) -> bool {
        match (&self.id, &other.id) {
            (Some(left), Some(right)) => left == right,
            _ => self.pair() == other.pair(),
        }
    }
}

/// Category of an attachment. Determines the multipart field it is uploaded
/// under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    #[serde(alias = "other", alias = "document")]
    File,
}

impl AttachmentKind {
    /// Classifies by MIME type; anything that is not an image or video is a file.
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            Self::Image
        } else if mime_type.starts_with("video/") {
            Self::Video
        } else {
            Self::File
        }
    }

    pub fn form_field(&self) -> &'static str {
        match self {
            Self::Image => "images[]",
            Self::Video => "videos[]",
            Self::File => "files[]",
        }
    }
}

/// Opaque attachment descriptor carried on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Retrieval URL. Absent on optimistic copies until the upload is stored.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Attachment bytes queued for upload with an outgoing message.
#[derive(Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub kind: AttachmentKind,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl OutgoingAttachment {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let mime_type = mime_type.into();
        Self {
            kind: AttachmentKind::from_mime(&mime_type),
            file_name: file_name.into(),
            mime_type,
            bytes,
        }
    }

    /// Descriptor shown on the optimistic copy of the message.
    pub fn descriptor(&self) -> Attachment {
        Attachment {
            kind: self.kind,
            url: None,
            name: Some(self.file_name.clone()),
            mime_type: Some(self.mime_type.clone()),
        }
    }
}

impl fmt::Debug for OutgoingAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingAttachment")
            .field("kind", &self.kind)
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Local delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Inserted optimistically, durable write in flight.
    Pending,
    /// Acknowledged by the backend.
    #[default]
    Confirmed,
    /// Durable write failed; waiting for a user-triggered retry.
    Failed,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_echo_id: Option<LocalEchoId>,
    /// Never on the wire; anything decoded from the backend is confirmed.
    #[serde(skip)]
    pub status: DeliveryStatus,
}

impl Message {
    /// Builds the optimistic local copy of an outgoing message.
    pub fn optimistic(
        local_echo_id: LocalEchoId,
        sender_id: UserId,
        conversation_id: Option<ConversationId>,
        body: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            id: None,
            conversation_id,
            sender_id,
            body,
            attachments,
            created_at: Utc::now(),
            local_echo_id: Some(local_echo_id),
            status: DeliveryStatus::Pending,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == DeliveryStatus::Confirmed
    }

    /// True when both entries describe the same logical message, either by
    /// server id or by local echo token.
    pub fn same_logical(&self, other: &Message) -> bool {
        let same_id = matches!((&self.id, &other.id), (Some(a), Some(b)) if a == b);
        let same_echo =
            matches!((&self.local_echo_id, &other.local_echo_id), (Some(a), Some(b)) if a == b);
        same_id || same_echo
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Model-level errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MessagingError>;
