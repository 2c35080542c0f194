use super::runtime::{TransportCommand, TransportRuntime};
use super::{
    ChannelTransport, EventHandler, SubscriptionRegistry, SubscriptionToken, TransportConfig,
    TransportError, TransportResult, TransportStatus,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct Connection {
    command_tx: mpsc::UnboundedSender<TransportCommand>,
    runtime_task: JoinHandle<()>,
}

/// Push transport speaking JSON frames over a websocket.
///
/// A background [`TransportRuntime`] owns the socket. It reconnects with
/// backoff and re-joins every channel in the registry after each reconnect,
/// so callers never resubscribe by hand.
pub struct WebSocketTransport {
    config: TransportConfig,
    registry: SubscriptionRegistry,
    status_tx: broadcast::Sender<TransportStatus>,
    connection: Mutex<Option<Connection>>,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (status_tx, _rx) = broadcast::channel(32);
        Self {
            config,
            registry: SubscriptionRegistry::new(),
            status_tx,
            connection: Mutex::new(None),
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.registry.is_subscribed(channel)
    }

    fn send_command(&self, command: TransportCommand) {
        if let Some(connection) = self.connection.lock().as_ref() {
            // A dead runtime means there is nothing to tell; the registry is
            // replayed on the next connect anyway.
            let _ = connection.command_tx.send(command);
        }
    }
}

impl ChannelTransport for WebSocketTransport {
    fn connect(&self) -> TransportResult<()> {
        let mut connection = self.connection.lock();
        if connection
            .as_ref()
            .is_some_and(|existing| !existing.runtime_task.is_finished())
        {
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connection(format!("no async runtime: {e}")))?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let runtime = TransportRuntime::new(
            self.config.clone(),
            self.registry.clone(),
            self.status_tx.clone(),
            command_rx,
        );
        let runtime_task = handle.spawn(runtime.run());
        info!(url = %self.config.url, "push transport started");

        *connection = Some(Connection {
            command_tx,
            runtime_task,
        });
        Ok(())
    }

    fn subscribe(
        &self,
        channel: &str,
        event: &str,
        handler: EventHandler,
    ) -> TransportResult<SubscriptionToken> {
        let (token, first) = self.registry.register(channel, event, handler)?;
        if first {
            self.send_command(TransportCommand::Join(channel.to_owned()));
        }
        debug!(channel, event, ?token, "subscribed");
        Ok(token)
    }

    fn unsubscribe(&self, channel: &str) -> TransportResult<()> {
        if self.registry.remove_channel(channel)? {
            self.send_command(TransportCommand::Leave(channel.to_owned()));
            debug!(channel, "unsubscribed");
        }
        Ok(())
    }

    fn remove(&self, token: SubscriptionToken) -> TransportResult<()> {
        if let Some(channel) = self.registry.remove(token)? {
            debug!(channel = %channel, "last handler removed");
            self.send_command(TransportCommand::Leave(channel));
        }
        Ok(())
    }

    fn status(&self) -> broadcast::Receiver<TransportStatus> {
        self.status_tx.subscribe()
    }

    fn disconnect(&self) {
        let _ = self.registry.clear();
        if let Some(connection) = self.connection.lock().take() {
            if connection.command_tx.send(TransportCommand::Shutdown).is_err() {
                connection.runtime_task.abort();
            }
            info!(url = %self.config.url, "push transport stopped");
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.runtime_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReconnectPolicy;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn next_json<S>(source: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = timeout(Duration::from_secs(5), source.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("valid frame");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn joins_channels_delivers_events_and_rejoins_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = WebSocketTransport::new(
            TransportConfig::new(format!("ws://{addr}")).with_reconnect(
                ReconnectPolicy::default().with_initial_backoff(Duration::from_millis(20)),
            ),
        );
        let mut status = transport.status();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        transport
            .subscribe(
                "conversation.c1",
                "message.sent",
                Arc::new(move |payload: &Value| {
                    let _ = event_tx.send(payload.clone());
                }),
            )
            .unwrap();
        transport.connect().unwrap();
        transport.connect().unwrap();

        // First session: the runtime joins the pre-registered channel.
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();
        assert_eq!(status.recv().await.unwrap(), TransportStatus::Connected);
        assert_eq!(
            next_json(&mut socket).await,
            json!({ "event": "subscribe", "channel": "conversation.c1" })
        );

        let frame = json!({
            "event": "message.sent",
            "channel": "conversation.c1",
            "data": "{\"id\":\"m1\"}"
        });
        socket.send(WsMessage::text(frame.to_string())).await.unwrap();
        let payload = timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, json!({ "id": "m1" }));

        // Server drops the connection; the runtime reconnects and re-joins.
        drop(socket);
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();
        assert_eq!(status.recv().await.unwrap(), TransportStatus::Disconnected);
        assert_eq!(status.recv().await.unwrap(), TransportStatus::Reconnected);
        // The rejoin frame was written before the status went out.
        assert_eq!(
            next_json(&mut socket).await,
            json!({ "event": "subscribe", "channel": "conversation.c1" })
        );

        transport.unsubscribe("conversation.c1").unwrap();
        assert_eq!(
            next_json(&mut socket).await,
            json!({ "event": "unsubscribe", "channel": "conversation.c1" })
        );

        transport.disconnect();
    }

    #[tokio::test]
    async fn unsubscribe_before_connect_is_a_noop() {
        let transport = WebSocketTransport::new(TransportConfig::new("ws://127.0.0.1:9"));
        transport.unsubscribe("conversation.c9").unwrap();
        assert!(!transport.is_subscribed("conversation.c9"));
    }
}
