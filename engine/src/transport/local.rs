use super::{
    ChannelTransport, EventHandler, SubscriptionRegistry, SubscriptionToken, TransportResult,
    TransportStatus,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

struct LocalInner {
    registry: SubscriptionRegistry,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    status_tx: broadcast::Sender<TransportStatus>,
}

/// In-process transport. Whatever is published is delivered synchronously to
/// the registered handlers, unless the connection is down.
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<LocalInner>,
}

impl LocalTransport {
    pub fn new() -> Self {
        let (status_tx, _rx) = broadcast::channel(32);
        Self {
            inner: Arc::new(LocalInner {
                registry: SubscriptionRegistry::new(),
                connected: AtomicBool::new(false),
                ever_connected: AtomicBool::new(false),
                status_tx,
            }),
        }
    }

    /// Delivers `payload` to every handler of `event` on `channel` and
    /// returns how many ran. Publishing while disconnected delivers nothing.
    pub fn publish(&self, channel: &str, event: &str, payload: Value) -> usize {
        if !self.is_connected() {
            debug!(channel, event, "dropping push while disconnected");
            return 0;
        }
        match self.inner.registry.dispatch(channel, event, &payload) {
            Ok(delivered) => {
                trace!(channel, event, delivered, "push delivered");
                delivered
            }
            Err(error) => {
                debug!(channel, event, %error, "push dispatch failed");
                0
            }
        }
    }

    pub fn publish_json<T: Serialize>(
        &self,
        channel: &str,
        event: &str,
        payload: &T,
    ) -> serde_json::Result<usize> {
        Ok(self.publish(channel, event, serde_json::to_value(payload)?))
    }

    /// Simulates a connection loss. Registrations survive.
    pub fn drop_connection(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inner.status_tx.send(TransportStatus::Disconnected);
        }
    }

    /// Restores a dropped connection.
    pub fn restore_connection(&self) {
        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            let _ = self.inner.status_tx.send(TransportStatus::Reconnected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.registry.is_subscribed(channel)
    }

    pub fn active_channels(&self) -> Vec<String> {
        self.inner.registry.channels().unwrap_or_default()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.registry.handler_count()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport for LocalTransport {
    fn connect(&self) -> TransportResult<()> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let status = if self.inner.ever_connected.swap(true, Ordering::SeqCst) {
            TransportStatus::Reconnected
        } else {
            TransportStatus::Connected
        };
        let _ = self.inner.status_tx.send(status);
        Ok(())
    }

    fn subscribe(
        &self,
        channel: &str,
        event: &str,
        handler: EventHandler,
    ) -> TransportResult<SubscriptionToken> {
        let (token, _) = self.inner.registry.register(channel, event, handler)?;
        debug!(channel, event, ?token, "subscribed");
        Ok(token)
    }

    fn unsubscribe(&self, channel: &str) -> TransportResult<()> {
        if self.inner.registry.remove_channel(channel)? {
            debug!(channel, "unsubscribed");
        }
        Ok(())
    }

    fn remove(&self, token: SubscriptionToken) -> TransportResult<()> {
        if let Some(channel) = self.inner.registry.remove(token)? {
            debug!(channel = %channel, "last handler removed");
        }
        Ok(())
    }

    fn status(&self) -> broadcast::Receiver<TransportStatus> {
        self.inner.status_tx.subscribe()
    }

    fn disconnect(&self) {
        let _ = self.inner.registry.clear();
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inner.status_tx.send(TransportStatus::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn connect_is_idempotent() {
        let transport = LocalTransport::new();
        let mut status = transport.status();

        transport.connect().unwrap();
        transport.connect().unwrap();

        assert_eq!(status.recv().await.unwrap(), TransportStatus::Connected);
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn outage_drops_pushes_and_reports_reconnect() {
        let transport = LocalTransport::new();
        transport.connect().unwrap();
        let mut status = transport.status();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        transport
            .subscribe(
                "conversation.c1",
                "message.sent",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        transport.drop_connection();
        assert_eq!(transport.publish("conversation.c1", "message.sent", json!({})), 0);
        transport.restore_connection();
        assert_eq!(transport.publish("conversation.c1", "message.sent", json!({})), 1);

        assert_eq!(status.recv().await.unwrap(), TransportStatus::Disconnected);
        assert_eq!(status.recv().await.unwrap(), TransportStatus::Reconnected);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(transport.is_subscribed("conversation.c1"));
    }

    #[test]
    fn unsubscribe_unknown_channel_is_ok() {
        let transport = LocalTransport::new();
        transport.unsubscribe("conversation.missing").unwrap();
    }

    #[test]
    fn disconnect_drops_registrations() {
        let transport = LocalTransport::new();
        transport.connect().unwrap();
        transport
            .subscribe("conversation.c1", "message.sent", Arc::new(|_| {}))
            .unwrap();
        transport.disconnect();
        assert_eq!(transport.handler_count(), 0);
        assert!(!transport.is_connected());
    }
}
