use super::{GatewayError, GatewayResult, MessageGateway, NotificationGateway};
use crate::transport::LocalTransport;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mercato_messaging::wire::{
    conversation_channel, notifications_channel, NotificationPage, OutgoingMessage, SendReceipt,
    SendTarget, MESSAGE_EVENT, NOTIFICATION_EVENT,
};
use mercato_messaging::{
    Attachment, Conversation, ConversationId, CounterKind, Message, MessageId, Notification,
    NotificationId, NotificationKind, UserId,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

const PAGE_SIZE: usize = 20;

/// Gateway operations, used to inject failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Resolve,
    ListMessages,
    SendMessage,
    MarkConversationRead,
    UnreadCount,
    ListNotifications,
    MarkRead,
    MarkAllRead,
}

#[derive(Default)]
struct Backend {
    next_id: u64,
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    notifications: HashMap<UserId, Vec<Notification>>,
    failing: HashSet<Operation>,
    gates: HashMap<Operation, Arc<Semaphore>>,
    calls: HashMap<Operation, usize>,
    transports: Vec<LocalTransport>,
}

impl Backend {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn find_pair(&self, a: &UserId, b: &UserId) -> Option<&Conversation> {
        let probe = Conversation::pending(a.clone(), b.clone());
        self.conversations
            .iter()
            .find(|conversation| conversation.same_identity(&probe))
    }

    fn find(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| conversation.id.as_ref() == Some(id))
    }

    fn create_conversation(&mut self, a: &UserId, b: &UserId) -> ConversationId {
        let id = ConversationId::new(self.next_id("c"));
        self.conversations.push(Conversation {
            id: Some(id.clone()),
            participant_a: a.clone(),
            participant_b: b.clone(),
        });
        self.messages.insert(id.clone(), Vec::new());
        id
    }

    fn store_notification(
        &mut self,
        user: &UserId,
        kind: NotificationKind,
        actor: &UserId,
        subject_ref: Option<String>,
    ) -> Notification {
        let notification = Notification {
            id: NotificationId::new(self.next_id("n")),
            kind,
            actor_id: actor.clone(),
            subject_ref,
            is_read: false,
            created_at: Utc::now(),
        };
        self.notifications
            .entry(user.clone())
            .or_default()
            .push(notification.clone());
        notification
    }
}

/// Backend simulation shared by every session created from it.
///
/// Each handle acts on behalf of one user. Writes are published to every
/// attached [`LocalTransport`], the sender's included, the way a real backend
/// broadcasts to all connected clients.
#[derive(Clone)]
pub struct InMemoryGateway {
    user: UserId,
    backend: Arc<Mutex<Backend>>,
}

impl InMemoryGateway {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            backend: Arc::new(Mutex::new(Backend::default())),
        }
    }

    /// A handle for `user` on the same backend.
    pub fn session(&self, user: UserId) -> Self {
        Self {
            user,
            backend: self.backend.clone(),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Publishes stored messages and notifications through `transport`.
    pub fn broadcast_via(&self, transport: LocalTransport) {
        self.backend.lock().transports.push(transport);
    }

    pub fn fail(&self, operation: Operation) {
        self.backend.lock().failing.insert(operation);
    }

    pub fn heal(&self, operation: Operation) {
        self.backend.lock().failing.remove(&operation);
    }

    /// Blocks calls to `operation` (after they are counted) until
    /// [`release`](Self::release).
    pub fn hold(&self, operation: Operation) {
        self.backend
            .lock()
            .gates
            .insert(operation, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, operation: Operation) {
        if let Some(gate) = self.backend.lock().gates.remove(&operation) {
            gate.close();
        }
    }

    pub fn calls(&self, operation: Operation) -> usize {
        self.backend
            .lock()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn seed_conversation(&self, a: &UserId, b: &UserId) -> ConversationId {
        let mut backend = self.backend.lock();
        match backend.find_pair(a, b).and_then(|c| c.id.clone()) {
            Some(id) => id,
            None => backend.create_conversation(a, b),
        }
    }

    /// Stores a message without publishing it.
    pub fn seed_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        let mut backend = self.backend.lock();
        let message = Message {
            id: Some(MessageId::new(backend.next_id("m"))),
            conversation_id: Some(conversation.clone()),
            sender_id: sender.clone(),
            body: Some(body.to_owned()),
            attachments: Vec::new(),
            created_at,
            local_echo_id: None,
            status: Default::default(),
        };
        backend
            .messages
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());
        message
    }

    /// Raises a notification for `user` and publishes it.
    pub fn notify(
        &self,
        user: &UserId,
        kind: NotificationKind,
        actor: &UserId,
        subject_ref: Option<&str>,
    ) -> Notification {
        let (notification, transports) = {
            let mut backend = self.backend.lock();
            let notification =
                backend.store_notification(user, kind, actor, subject_ref.map(str::to_owned));
            (notification, backend.transports.clone())
        };
        publish(
            &transports,
            &notifications_channel(user),
            NOTIFICATION_EVENT,
            &notification,
        );
        notification
    }

    pub fn stored_messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.backend
            .lock()
            .messages
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stored_notifications(&self, user: &UserId) -> Vec<Notification> {
        self.backend
            .lock()
            .notifications
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    /// Counts the call, fails it if requested, and waits on a held gate.
    async fn enter(&self, operation: Operation) -> GatewayResult<()> {
        let gate = {
            let mut backend = self.backend.lock();
            *backend.calls.entry(operation).or_default() += 1;
            backend.gates.get(&operation).cloned()
        };
        if let Some(gate) = gate {
            // Closing the semaphore is the release signal.
            let _ = gate.acquire().await;
        }
        if self.backend.lock().failing.contains(&operation) {
            debug!(?operation, "injected gateway failure");
            return Err(GatewayError::Unavailable(format!(
                "injected failure: {operation:?}"
            )));
        }
        Ok(())
    }
}

fn publish<T: Serialize>(transports: &[LocalTransport], channel: &str, event: &str, payload: &T) {
    for transport in transports {
        if let Err(error) = transport.publish_json(channel, event, payload) {
            debug!(channel, %error, "failed to encode push payload");
        }
    }
}

#[async_trait]
impl MessageGateway for InMemoryGateway {
    async fn resolve_conversation(&self, a: &UserId, b: &UserId) -> GatewayResult<Conversation> {
        self.enter(Operation::Resolve).await?;
        let backend = self.backend.lock();
        Ok(backend
            .find_pair(a, b)
            .cloned()
            .unwrap_or_else(|| Conversation::pending(a.clone(), b.clone())))
    }

    async fn list_messages(&self, conversation: &ConversationId) -> GatewayResult<Vec<Message>> {
        self.enter(Operation::ListMessages).await?;
        self.backend
            .lock()
            .messages
            .get(conversation)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {conversation}")))
    }

    async fn send_message(&self, outgoing: OutgoingMessage) -> GatewayResult<SendReceipt> {
        self.enter(Operation::SendMessage).await?;

        let (receipt, recipient_notice, transports) = {
            let mut backend = self.backend.lock();
            let conversation_id = match &outgoing.target {
                SendTarget::Conversation(id) => {
                    let conversation = backend
                        .find(id)
                        .ok_or_else(|| GatewayError::NotFound(format!("conversation {id}")))?;
                    if !conversation.involves(&self.user) {
                        return Err(GatewayError::Status {
                            status: 403,
                            body: format!("{} is not a participant", self.user),
                        });
                    }
                    id.clone()
                }
                SendTarget::Peer(peer) => match backend.find_pair(&self.user, peer) {
                    Some(existing) => existing.id.clone().ok_or_else(|| {
                        GatewayError::Decode("stored conversation without id".into())
                    })?,
                    None => backend.create_conversation(&self.user, peer),
                },
            };

            let message_id = MessageId::new(backend.next_id("m"));
            let attachments = outgoing
                .attachments
                .iter()
                .map(|upload| Attachment {
                    url: Some(format!(
                        "memory://{conversation_id}/{message_id}/{}",
                        upload.file_name
                    )),
                    ..upload.descriptor()
                })
                .collect();
            // Server clock never runs behind an optimistic copy.
            let created_at = backend
                .messages
                .get(&conversation_id)
                .and_then(|messages| messages.iter().map(|m| m.created_at).max())
                .map(|latest| latest.max(Utc::now()))
                .unwrap_or_else(Utc::now)
                + ChronoDuration::milliseconds(1);
            let message = Message {
                id: Some(message_id),
                conversation_id: Some(conversation_id.clone()),
                sender_id: self.user.clone(),
                body: outgoing.body,
                attachments,
                created_at,
                local_echo_id: Some(outgoing.local_echo_id),
                status: Default::default(),
            };
            backend
                .messages
                .entry(conversation_id.clone())
                .or_default()
                .push(message.clone());

            let recipient = backend
                .find(&conversation_id)
                .and_then(|conversation| conversation.peer_of(&self.user).cloned());
            let notice = recipient.map(|recipient| {
                let notification = backend.store_notification(
                    &recipient,
                    NotificationKind::Message,
                    &self.user,
                    Some(conversation_id.to_string()),
                );
                (recipient, notification)
            });

            (
                SendReceipt {
                    message,
                    conversation_id,
                },
                notice,
                backend.transports.clone(),
            )
        };

        publish(
            &transports,
            &conversation_channel(&receipt.conversation_id),
            MESSAGE_EVENT,
            &receipt.message,
        );
        if let Some((recipient, notification)) = recipient_notice {
            publish(
                &transports,
                &notifications_channel(&recipient),
                NOTIFICATION_EVENT,
                &notification,
            );
        }
        Ok(receipt)
    }

    async fn mark_conversation_read(&self, conversation: &ConversationId) -> GatewayResult<()> {
        self.enter(Operation::MarkConversationRead).await?;
        let mut backend = self.backend.lock();
        if let Some(items) = backend.notifications.get_mut(&self.user) {
            for item in items.iter_mut().filter(|item| {
                item.kind == NotificationKind::Message
                    && item.subject_ref.as_deref() == Some(conversation.as_str())
            }) {
                item.is_read = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for InMemoryGateway {
    async fn unread_count(&self, kind: CounterKind) -> GatewayResult<u64> {
        self.enter(Operation::UnreadCount).await?;
        let backend = self.backend.lock();
        let count = backend
            .notifications
            .get(&self.user)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.counter() == kind && !item.is_read)
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn list_notifications(
        &self,
        kind: CounterKind,
        page: u32,
    ) -> GatewayResult<NotificationPage> {
        self.enter(Operation::ListNotifications).await?;
        let backend = self.backend.lock();
        let mut items: Vec<Notification> = backend
            .notifications
            .get(&self.user)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.counter() == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let page = page.max(1);
        let start = (page as usize - 1) * PAGE_SIZE;
        let has_more = items.len() > start + PAGE_SIZE;
        let data = items.into_iter().skip(start).take(PAGE_SIZE).collect();
        Ok(NotificationPage {
            data,
            page,
            has_more,
        })
    }

    async fn mark_read(&self, id: &NotificationId) -> GatewayResult<()> {
        self.enter(Operation::MarkRead).await?;
        let mut backend = self.backend.lock();
        let item = backend
            .notifications
            .get_mut(&self.user)
            .and_then(|items| items.iter_mut().find(|item| &item.id == id))
            .ok_or_else(|| GatewayError::NotFound(format!("notification {id}")))?;
        item.is_read = true;
        Ok(())
    }

    async fn mark_all_read(&self, kind: CounterKind) -> GatewayResult<()> {
        self.enter(Operation::MarkAllRead).await?;
        let mut backend = self.backend.lock();
        if let Some(items) = backend.notifications.get_mut(&self.user) {
            for item in items.iter_mut().filter(|item| item.counter() == kind) {
                item.is_read = true;
            }
        }
        Ok(())
    }
}
