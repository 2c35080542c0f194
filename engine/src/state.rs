use crate::config::EngineConfig;
use crate::conversation::ConversationStore;
use crate::gateway::{HttpGateway, MessageGateway, NotificationGateway};
use crate::messaging::SendPipeline;
use crate::notifications::NotificationCenter;
use crate::transport::{ChannelTransport, TransportStatus, WebSocketTransport};
use anyhow::Context;
use mercato_messaging::UserId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Service object wiring one transport, one gateway and the components built
/// on them for a single signed-in user.
pub struct Engine {
    self_id: UserId,
    transport: Arc<dyn ChannelTransport>,
    store: ConversationStore,
    pipeline: SendPipeline,
    notifications: NotificationCenter,
    resync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new<G>(
        self_id: UserId,
        config: &EngineConfig,
        gateway: Arc<G>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Self
    where
        G: MessageGateway + NotificationGateway + 'static,
    {
        let messages: Arc<dyn MessageGateway> = gateway.clone();
        let notifications = NotificationCenter::new(gateway, config.poll_interval);
        let store = ConversationStore::new(
            self_id.clone(),
            messages.clone(),
            transport.clone(),
            Some(notifications.clone()),
        );
        let pipeline = SendPipeline::new(messages, store.clone());

        Self {
            self_id,
            transport,
            store,
            pipeline,
            notifications,
            resync_task: Mutex::new(None),
        }
    }

    /// Builds an engine talking to the HTTP API and websocket push endpoint
    /// named in `config`.
    pub fn connect_http(self_id: UserId, config: &EngineConfig) -> anyhow::Result<Self> {
        let gateway = HttpGateway::new(
            &config.api_base_url,
            config.auth_token.clone(),
            config.request_timeout,
        )
        .context("failed to build HTTP gateway")?;
        let transport = WebSocketTransport::new(config.transport());
        Ok(Self::new(self_id, config, Arc::new(gateway), Arc::new(transport)))
    }

    /// Connects the transport, listens for pushed notifications, starts
    /// polling and resynchronises after every reconnect. Calling it again
    /// while running is a no-op.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut resync_task = self.resync_task.lock();
        if resync_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return Ok(());
        }

        let mut status = self.transport.status();
        self.transport
            .connect()
            .context("failed to connect push transport")?;
        self.notifications
            .attach_push(self.transport.clone(), &self.self_id)
            .context("failed to subscribe to notifications")?;
        self.notifications
            .start_polling()
            .context("failed to start notification polling")?;

        let store = self.store.clone();
        let notifications = self.notifications.clone();
        *resync_task = Some(tokio::spawn(async move {
            loop {
                match status.recv().await {
                    Ok(TransportStatus::Reconnected) => {}
                    Ok(TransportStatus::Disconnected) => {
                        warn!("push connection lost, waiting for reconnect");
                        continue;
                    }
                    Ok(TransportStatus::Connected) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed transport status updates, resynchronising");
                    }
                    Err(RecvError::Closed) => break,
                }

                info!("push connection restored, resynchronising");
                if let Err(error) = store.resync().await {
                    warn!(%error, "conversation resync failed");
                }
                if let Err(error) = notifications.refresh_all().await {
                    warn!(%error, "counter resync failed");
                }
            }
        }));

        info!(user = %self.self_id, "engine started");
        Ok(())
    }

    /// Stops background work, closes the open conversation and disconnects.
    pub fn shutdown(&self) {
        if let Some(task) = self.resync_task.lock().take() {
            task.abort();
        }
        self.notifications.stop_polling();
        self.notifications.detach_push();
        self.store.close();
        self.transport.disconnect();
        info!(user = %self.self_id, "engine stopped");
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.store
    }

    pub fn pipeline(&self) -> &SendPipeline {
        &self.pipeline
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.transport
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.resync_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryGateway, Operation};
    use crate::messaging::Draft;
    use crate::transport::LocalTransport;
    use chrono::Utc;
    use mercato_messaging::wire::conversation_channel;
    use mercato_messaging::CounterKind;
    use std::time::Duration;

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_releases_everything() {
        let backend = InMemoryGateway::new(UserId::new("alice"));
        let transport = LocalTransport::new();
        let engine = Engine::new(
            UserId::new("alice"),
            &EngineConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(transport.clone()),
        );

        engine.start().unwrap();
        engine.start().unwrap();
        assert!(transport.is_connected());
        assert!(engine.notifications().is_polling());
        assert_eq!(transport.active_channels(), vec!["notifications.alice".to_owned()]);

        engine.shutdown();
        assert!(!transport.is_connected());
        assert!(!engine.notifications().is_polling());
        assert_eq!(transport.handler_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_triggers_pull_resync() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let backend = InMemoryGateway::new(alice.clone());
        let transport = LocalTransport::new();
        backend.broadcast_via(transport.clone());
        let engine = Engine::new(
            alice.clone(),
            &EngineConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(transport.clone()),
        );
        engine.start().unwrap();

        let id = backend.seed_conversation(&alice, &bob);
        engine.conversations().open(&bob).await.unwrap();
        assert!(transport.is_subscribed(&conversation_channel(&id)));

        transport.drop_connection();
        backend.seed_message(&id, &bob, "sent during outage", Utc::now());
        backend.notify(&alice, mercato_messaging::NotificationKind::Like, &bob, None);
        let list_calls = backend.calls(Operation::ListMessages);
        transport.restore_connection();

        let mut counters = engine.notifications().watch_counters();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.conversations().snapshot().messages.is_empty()
                || engine.notifications().counter(CounterKind::Activity) == 0
            {
                let _ = counters.changed().await;
            }
        })
        .await
        .unwrap();

        assert!(backend.calls(Operation::ListMessages) > list_calls);
        assert_eq!(
            engine.conversations().snapshot().messages[0].body.as_deref(),
            Some("sent during outage")
        );

        engine
            .pipeline()
            .send(&engine.conversations().active().unwrap(), Draft::text("back"))
            .await
            .unwrap();
        assert_eq!(engine.conversations().snapshot().messages.len(), 2);
        engine.shutdown();
    }
}
