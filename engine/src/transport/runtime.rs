use super::{SubscriptionRegistry, TransportConfig, TransportError, TransportResult, TransportStatus};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIBE: &str = "subscribe";
const UNSUBSCRIBE: &str = "unsubscribe";

/// Commands sent to the transport runtime.
#[derive(Debug)]
pub(crate) enum TransportCommand {
    Join(String),
    Leave(String),
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    /// Dropped before the session was announced.
    Rejected(String),
    Lost(String),
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

/// A pushed event addressed to a channel.
#[derive(Debug, PartialEq)]
pub(crate) struct ChannelEvent {
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

/// Parses an inbound text frame. Frames without a channel are connection
/// housekeeping and yield `None`. Some servers double-encode `data` as a JSON
/// string; that is unwrapped here.
pub(crate) fn parse_frame(text: &str) -> TransportResult<Option<ChannelEvent>> {
    let frame: InboundFrame =
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))?;
    let Some(channel) = frame.channel else {
        return Ok(None);
    };
    let payload = match frame.data {
        Value::String(encoded) => serde_json::from_str(&encoded).unwrap_or(Value::String(encoded)),
        other => other,
    };
    Ok(Some(ChannelEvent {
        channel,
        event: frame.event,
        payload,
    }))
}

fn control_frame(action: &str, channel: &str) -> WsMessage {
    WsMessage::text(json!({ "event": action, "channel": channel }).to_string())
}

/// Owns the websocket: connects, pumps frames into the registry, applies
/// join/leave commands, and reconnects with backoff until shut down.
pub(crate) struct TransportRuntime {
    config: TransportConfig,
    registry: SubscriptionRegistry,
    status_tx: broadcast::Sender<TransportStatus>,
    command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    connected_once: bool,
}

impl TransportRuntime {
    pub fn new(
        config: TransportConfig,
        registry: SubscriptionRegistry,
        status_tx: broadcast::Sender<TransportStatus>,
        command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    ) -> Self {
        Self {
            config,
            registry,
            status_tx,
            command_rx,
            connected_once: false,
        }
    }

    pub async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            match self.open().await {
                Ok(socket) => match self.drive(socket).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Rejected(reason) => {
                        warn!(url = %self.config.url, reason = reason.as_str(), "push connection dropped while rejoining");
                    }
                    SessionEnd::Lost(reason) => {
                        attempt = 0;
                        warn!(url = %self.config.url, reason = reason.as_str(), "push connection lost");
                        let _ = self.status_tx.send(TransportStatus::Disconnected);
                    }
                },
                Err(error) => {
                    warn!(url = %self.config.url, %error, attempt, "push connection failed");
                }
            }

            let delay = self.config.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            if !self.wait_before_retry(delay).await {
                break;
            }
        }
        debug!(url = %self.config.url, "push runtime stopped");
    }

    async fn open(&self) -> TransportResult<Socket> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(socket)
    }

    async fn drive(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut source) = socket.split();

        let channels = match self.registry.channels() {
            Ok(channels) => channels,
            Err(error) => return SessionEnd::Rejected(error.to_string()),
        };
        for channel in channels {
            if let Err(error) = sink.send(control_frame(SUBSCRIBE, &channel)).await {
                return SessionEnd::Rejected(error.to_string());
            }
        }
        // Status goes out only after every live channel is joined again.
        self.announce();

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let frame = match command {
                        Some(TransportCommand::Join(channel)) => control_frame(SUBSCRIBE, &channel),
                        Some(TransportCommand::Leave(channel)) => control_frame(UNSUBSCRIBE, &channel),
                        Some(TransportCommand::Shutdown) | None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return SessionEnd::Shutdown;
                        }
                    };
                    if let Err(error) = sink.send(frame).await {
                        return SessionEnd::Lost(error.to_string());
                    }
                }
                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return SessionEnd::Lost("closed by server".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => return SessionEnd::Lost(error.to_string()),
                }
            }
        }
    }

    fn announce(&mut self) {
        let status = if self.connected_once {
            TransportStatus::Reconnected
        } else {
            TransportStatus::Connected
        };
        self.connected_once = true;
        info!(url = %self.config.url, ?status, "push connection established");
        let _ = self.status_tx.send(status);
    }

    fn dispatch(&self, text: &str) {
        match parse_frame(text) {
            Ok(Some(event)) => {
                match self
                    .registry
                    .dispatch(&event.channel, &event.event, &event.payload)
                {
                    Ok(delivered) => trace!(
                        channel = %event.channel,
                        event = %event.event,
                        delivered,
                        "push delivered"
                    ),
                    Err(error) => warn!(channel = %event.channel, %error, "push dispatch failed"),
                }
            }
            Ok(None) => trace!(frame = text, "control frame"),
            Err(error) => warn!(%error, "malformed push frame"),
        }
    }

    /// Sleeps out the backoff. Join/leave commands that arrive meanwhile are
    /// dropped because the registry is replayed on connect. Returns false on
    /// shutdown.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.command_rx.recv() => match command {
                    Some(TransportCommand::Shutdown) | None => return false,
                    Some(_) => continue,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_events() {
        let event = parse_frame(
            r#"{"event":"message.sent","channel":"conversation.c1","data":{"id":"m1"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.channel, "conversation.c1");
        assert_eq!(event.event, "message.sent");
        assert_eq!(event.payload, json!({ "id": "m1" }));
    }

    #[test]
    fn unwraps_string_encoded_payloads() {
        let event = parse_frame(
            r#"{"event":"notification.created","channel":"notifications.4","data":"{\"id\":3}"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.payload, json!({ "id": 3 }));
    }

    #[test]
    fn control_frames_have_no_channel() {
        assert!(parse_frame(r#"{"event":"connection_established","data":{}}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(
            parse_frame("not json"),
            Err(TransportError::Protocol(_))
        ));
    }
}
