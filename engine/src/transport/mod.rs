//! Push delivery over named channels.
//!
//! A transport owns one process-wide connection. Components register
//! handlers for `(channel, event)` pairs and get a [`SubscriptionToken`] back;
//! the token is the only way to remove that single registration, so one
//! surface can never tear down another surface's handlers by accident.
//!
//! Delivery is at-least-once and is not replayed across outages. Every
//! transport publishes a [`TransportStatus`] stream; consumers resynchronise
//! by pull when they see [`TransportStatus::Reconnected`].

mod config;
mod local;
mod runtime;
mod subscriptions;
mod websocket;

pub use config::{ReconnectPolicy, TransportConfig};
pub use local::LocalTransport;
pub use subscriptions::{EventHandler, SubscriptionRegistry, SubscriptionToken};
pub use websocket::WebSocketTransport;

use mercato_messaging::wire::decode_payload;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("transport closed")]
    Closed,
}

/// Connection state changes published by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// First successful connection.
    Connected,
    /// The connection dropped; pushes sent until the next reconnect are lost.
    Disconnected,
    /// Connection restored after an outage. Channels are re-joined, missed
    /// events are not replayed.
    Reconnected,
}

pub trait ChannelTransport: Send + Sync {
    /// Establishes the connection. Calling it again is a no-op.
    fn connect(&self) -> TransportResult<()>;

    /// Registers `handler` for `event` on `channel`. Every registered handler
    /// fires for every matching event.
    fn subscribe(
        &self,
        channel: &str,
        event: &str,
        handler: EventHandler,
    ) -> TransportResult<SubscriptionToken>;

    /// Removes every handler on `channel`. Unknown channels are ignored.
    fn unsubscribe(&self, channel: &str) -> TransportResult<()>;

    /// Removes a single registration. Unknown tokens are ignored.
    fn remove(&self, token: SubscriptionToken) -> TransportResult<()>;

    fn status(&self) -> broadcast::Receiver<TransportStatus>;

    /// Closes the connection and drops every registration.
    fn disconnect(&self);
}

/// Subscribes a handler that receives the payload decoded as `T`.
///
/// Payloads that do not decode are logged and dropped.
pub fn subscribe_typed<T, F>(
    transport: &dyn ChannelTransport,
    channel: &str,
    event: &str,
    handler: F,
) -> TransportResult<SubscriptionToken>
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync + 'static,
{
    let channel_name = channel.to_owned();
    let event_name = event.to_owned();
    let handler: EventHandler = Arc::new(move |payload: &Value| {
        match decode_payload::<T>(payload) {
            Ok(decoded) => handler(decoded),
            Err(error) => warn!(
                channel = %channel_name,
                event = %event_name,
                %error,
                "dropping undecodable push payload"
            ),
        }
    });
    transport.subscribe(channel, event, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercato_messaging::wire::{conversation_channel, MESSAGE_EVENT};
    use mercato_messaging::{ConversationId, Message};
    use parking_lot::Mutex;
    use serde_json::json;

    #[tokio::test]
    async fn typed_handlers_skip_malformed_payloads() {
        let transport = LocalTransport::new();
        transport.connect().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let channel = conversation_channel(&ConversationId::new("c1"));
        subscribe_typed::<Message, _>(&transport, &channel, MESSAGE_EVENT, move |message| {
            sink.lock().push(message);
        })
        .unwrap();

        transport.publish(&channel, MESSAGE_EVENT, json!({ "garbage": true }));
        transport.publish(
            &channel,
            MESSAGE_EVENT,
            json!({
                "id": "m1",
                "conversation_id": "c1",
                "sender_id": "bob",
                "body": "hello",
                "created_at": "2024-03-01T10:00:00Z"
            }),
        );

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body.as_deref(), Some("hello"));
    }
}
