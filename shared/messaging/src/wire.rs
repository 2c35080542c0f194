//! Request and response shapes exchanged with the backend, plus the push
//! channel naming scheme.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ConversationId, LocalEchoId, Message, Notification, OutgoingAttachment, Result, UserId,
};

/// Event carrying a [`Message`] on a conversation channel.
pub const MESSAGE_EVENT: &str = "message.sent";

/// Event carrying a [`Notification`] on a user's notification channel.
pub const NOTIFICATION_EVENT: &str = "notification.created";

pub fn conversation_channel(id: &ConversationId) -> String {
    format!("conversation.{id}")
}

pub fn notifications_channel(user: &UserId) -> String {
    format!("notifications.{user}")
}

/// Where an outgoing message is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// Durable conversation.
    Conversation(ConversationId),
    /// Pending intent; the backend creates the conversation on first write.
    Peer(UserId),
}

/// A durable write request for one message.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub target: SendTarget,
    pub body: Option<String>,
    pub attachments: Vec<OutgoingAttachment>,
    pub local_echo_id: LocalEchoId,
}

/// Backend acknowledgement of a stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message: Message,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnreadCount {
    pub count: u64,
}

/// One page of notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPage {
    #[serde(alias = "items")]
    pub data: Vec<Notification>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub has_more: bool,
}

/// Decodes a push payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    Ok(T::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NotificationKind;
    use serde_json::json;

    #[test]
    fn channel_names() {
        assert_eq!(
            conversation_channel(&ConversationId::new("c1")),
            "conversation.c1"
        );
        assert_eq!(
            notifications_channel(&UserId::new("42")),
            "notifications.42"
        );
    }

    #[test]
    fn send_receipt_carries_durable_conversation() {
        let receipt: SendReceipt = serde_json::from_value(json!({
            "message": {
                "id": "m1",
                "conversation_id": "c1",
                "sender_id": "alice",
                "body": "hello",
                "created_at": "2024-03-01T10:00:00Z"
            },
            "conversation_id": "c1"
        }))
        .unwrap();

        assert_eq!(receipt.conversation_id, ConversationId::new("c1"));
        assert_eq!(receipt.message.body.as_deref(), Some("hello"));
    }

    #[test]
    fn notification_page_accepts_items_alias() {
        let page: NotificationPage = serde_json::from_value(json!({
            "items": [{
                "id": "n1",
                "type": "reply",
                "actor_id": "bob",
                "created_at": "2024-03-01T10:00:00Z"
            }]
        }))
        .unwrap();

        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].kind, NotificationKind::Reply);
        assert!(!page.has_more);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        let result: Result<Message> = decode_payload(&json!({ "body": 3 }));
        assert!(result.is_err());
    }
}
