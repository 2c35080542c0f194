//! Durable reads and writes against the marketplace backend.

mod http;
mod memory;

pub use http::HttpGateway;
pub use memory::{InMemoryGateway, Operation};

use async_trait::async_trait;
use mercato_messaging::wire::{NotificationPage, OutgoingMessage, SendReceipt};
use mercato_messaging::{Conversation, ConversationId, CounterKind, Message, NotificationId, UserId};

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid base url: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Looks up the conversation between two participants, in either order.
    /// Returns a pending intent when none exists; never creates one.
    async fn resolve_conversation(&self, a: &UserId, b: &UserId) -> GatewayResult<Conversation>;

    async fn list_messages(&self, conversation: &ConversationId) -> GatewayResult<Vec<Message>>;

    /// Stores a message. Writing to a peer creates the conversation.
    async fn send_message(&self, message: OutgoingMessage) -> GatewayResult<SendReceipt>;

    async fn mark_conversation_read(&self, conversation: &ConversationId) -> GatewayResult<()>;
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn unread_count(&self, kind: CounterKind) -> GatewayResult<u64>;

    /// One-based page of notifications, newest first.
    async fn list_notifications(
        &self,
        kind: CounterKind,
        page: u32,
    ) -> GatewayResult<NotificationPage>;

    async fn mark_read(&self, id: &NotificationId) -> GatewayResult<()>;

    async fn mark_all_read(&self, kind: CounterKind) -> GatewayResult<()>;
}
