//! Send pipeline coordinating optimistic inserts, durable writes and retries.

use super::{DeliveryUpdate, PipelineError, Result, RetryQueue};
use crate::conversation::{ConversationStore, ReconcileOutcome};
use crate::gateway::MessageGateway;
use mercato_messaging::wire::{OutgoingMessage, SendReceipt, SendTarget};
use mercato_messaging::{
    Conversation, DeliveryStatus, LocalEchoId, Message, OutgoingAttachment, UserId,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Message composed by the user.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub body: Option<String>,
    pub attachments: Vec<OutgoingAttachment>,
}

impl Draft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: OutgoingAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// The body as typed, or `None` when it is only whitespace.
    fn typed_body(&self) -> Option<String> {
        self.body
            .as_deref()
            .filter(|body| !body.trim().is_empty())
            .map(str::to_owned)
    }
}

/// Send pipeline handling optimistic echo, delivery and reconciliation.
#[derive(Clone)]
pub struct SendPipeline {
    self_id: UserId,
    gateway: Arc<dyn MessageGateway>,
    store: ConversationStore,
    queue: RetryQueue,
    updates: broadcast::Sender<DeliveryUpdate>,
}

impl SendPipeline {
    pub fn new(gateway: Arc<dyn MessageGateway>, store: ConversationStore) -> Self {
        let (updates, _rx) = broadcast::channel(64);
        Self {
            self_id: store.self_id().clone(),
            gateway,
            queue: store.retry_queue().clone(),
            store,
            updates,
        }
    }

    /// Status changes of every message sent through this pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.updates.subscribe()
    }

    /// Failed sends waiting for [`retry`](Self::retry) or
    /// [`discard`](Self::discard).
    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Sends a message.
    ///
    /// The message shows up in the store as `pending` immediately. On success
    /// the same entry is confirmed with the server's id and timestamps; on
    /// failure it stays on screen as `failed` and the request is parked for
    /// retry.
    pub async fn send(&self, conversation: &Conversation, draft: Draft) -> Result<Message> {
        let body = draft.typed_body();
        if body.is_none() && draft.attachments.is_empty() {
            return Err(PipelineError::Validation(
                "message has neither text nor attachments".into(),
            ));
        }
        let target = self.target_for(conversation)?;

        let echo = LocalEchoId::new();
        let optimistic = Message::optimistic(
            echo,
            self.self_id.clone(),
            conversation.id.clone(),
            body.clone(),
            draft.attachments.iter().map(OutgoingAttachment::descriptor).collect(),
        );
        if !self.store.insert_local(conversation, optimistic.clone()) {
            debug!(%echo, "conversation not on screen, sending without local echo");
        }
        self.publish(DeliveryUpdate::new(echo, DeliveryStatus::Pending, None));

        let request = OutgoingMessage {
            target,
            body,
            attachments: draft.attachments,
            local_echo_id: echo,
        };
        self.deliver(conversation.clone(), request, optimistic, 1).await
    }

    /// Re-sends a failed message under its original echo id. A conversation
    /// promoted since the first attempt is addressed by its durable id.
    pub async fn retry(&self, echo: LocalEchoId) -> Result<Message> {
        let parked = self
            .queue
            .take(echo)
            .await
            .ok_or(PipelineError::UnknownMessage(echo))?;

        let conversation = self.current_identity(parked.conversation).await;
        let mut request = parked.request;
        if let Some(id) = &conversation.id {
            request.target = SendTarget::Conversation(id.clone());
        }

        self.store.set_status(echo, DeliveryStatus::Pending);
        self.publish(DeliveryUpdate::new(echo, DeliveryStatus::Pending, None));
        info!(%echo, attempt = parked.attempts + 1, "retrying message");
        self.deliver(conversation, request, parked.message, parked.attempts + 1)
            .await
    }

    /// Gives up on a failed message and removes it from the list.
    pub async fn discard(&self, echo: LocalEchoId) -> Result<()> {
        self.queue
            .take(echo)
            .await
            .ok_or(PipelineError::UnknownMessage(echo))?;
        self.store.remove_local(echo);
        info!(%echo, "failed message discarded");
        Ok(())
    }

    fn target_for(&self, conversation: &Conversation) -> Result<SendTarget> {
        if let Some(id) = &conversation.id {
            if !conversation.involves(&self.self_id) {
                return Err(PipelineError::Validation(format!(
                    "{} is not a participant of conversation {id}",
                    self.self_id
                )));
            }
            return Ok(SendTarget::Conversation(id.clone()));
        }
        conversation
            .peer_of(&self.self_id)
            .filter(|peer| *peer != &self.self_id)
            .map(|peer| SendTarget::Peer(peer.clone()))
            .ok_or_else(|| {
                PipelineError::Validation(format!(
                    "{} is not a participant of the pending conversation",
                    self.self_id
                ))
            })
    }

    async fn current_identity(&self, conversation: Conversation) -> Conversation {
        if !conversation.is_pending() {
            return conversation;
        }
        if let Some(active) = self.store.active() {
            if active.id.is_some() && active.same_identity(&conversation) {
                return active;
            }
        }
        let Some(peer) = conversation.peer_of(&self.self_id).cloned() else {
            return conversation;
        };
        match self.store.resolve_conversation(&peer).await {
            Ok(resolved) if resolved.id.is_some() => {
                if let Err(error) = self.store.promote(&resolved) {
                    warn!(%error, "failed to promote conversation before retry");
                }
                resolved
            }
            Ok(_) => conversation,
            Err(error) => {
                debug!(%error, "could not re-resolve conversation, retrying by peer");
                conversation
            }
        }
    }

    async fn deliver(
        &self,
        conversation: Conversation,
        request: OutgoingMessage,
        local: Message,
        attempts: u32,
    ) -> Result<Message> {
        let echo = request.local_echo_id;
        match self.gateway.send_message(request.clone()).await {
            Ok(SendReceipt {
                mut message,
                conversation_id,
            }) => {
                message.status = DeliveryStatus::Confirmed;
                message.local_echo_id.get_or_insert(echo);
                message
                    .conversation_id
                    .get_or_insert_with(|| conversation_id.clone());

                if conversation.is_pending() {
                    let durable = Conversation {
                        id: Some(conversation_id.clone()),
                        ..conversation
                    };
                    if let Err(error) = self.store.promote(&durable) {
                        warn!(conversation = %conversation_id, %error, "failed to subscribe promoted conversation");
                    }
                }

                match self.store.reconcile(echo, message.clone()) {
                    ReconcileOutcome::Updated => {}
                    ReconcileOutcome::Conflict => warn!(
                        %echo,
                        message = ?message.id,
                        "server copy already present, dropped optimistic entry"
                    ),
                    ReconcileOutcome::Missing => {
                        debug!(%echo, "no optimistic entry to reconcile")
                    }
                }
                info!(%echo, message = ?message.id, conversation = %conversation_id, "message delivered");
                self.publish(DeliveryUpdate::new(
                    echo,
                    DeliveryStatus::Confirmed,
                    message.id.clone(),
                ));
                Ok(message)
            }
            Err(source) => {
                warn!(%echo, attempts, error = %source, "message delivery failed");
                self.store.set_status(echo, DeliveryStatus::Failed);
                let failed = Message {
                    status: DeliveryStatus::Failed,
                    ..local
                };
                self.queue.park(conversation, request, failed, attempts).await;
                self.publish(DeliveryUpdate::new(echo, DeliveryStatus::Failed, None));
                Err(PipelineError::Delivery {
                    local_echo_id: echo,
                    source,
                })
            }
        }
    }

    fn publish(&self, update: DeliveryUpdate) {
        // No receivers is fine; presentation may not be listening.
        let _ = self.updates.send(update);
    }
}
