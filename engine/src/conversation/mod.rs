//! Active conversation state: identity resolution, the ordered message list
//! and the push subscription bound to it.
//!
//! Every surface mount or unmount bumps a generation counter. Async results
//! carry the generation they were issued under and are dropped when it is no
//! longer current, so a slow fetch for a conversation the user already left
//! cannot overwrite the one on screen.

mod timeline;

pub use timeline::{MergeOutcome, ReconcileOutcome, Timeline};

use crate::gateway::{GatewayError, MessageGateway};
use crate::messaging::RetryQueue;
use crate::notifications::NotificationCenter;
use crate::transport::{subscribe_typed, ChannelTransport, SubscriptionToken, TransportError};
use mercato_messaging::wire::{conversation_channel, MESSAGE_EVENT};
use mercato_messaging::{Conversation, ConversationId, DeliveryStatus, LocalEchoId, Message, UserId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("result of generation {0} discarded")]
    Stale(u64),
    #[error("no active conversation")]
    NotActive,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Point-in-time copy of the active conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    pub conversation: Option<Conversation>,
    pub messages: Vec<Message>,
    pub generation: u64,
}

struct Subscription {
    conversation: ConversationId,
    token: SubscriptionToken,
}

#[derive(Default)]
struct StoreState {
    generation: u64,
    conversation: Option<Conversation>,
    timeline: Timeline,
    subscription: Option<Subscription>,
}

impl StoreState {
    fn active_id(&self) -> Option<&ConversationId> {
        self.conversation.as_ref().and_then(|c| c.id.as_ref())
    }

    fn is_active(&self, conversation: &Conversation) -> bool {
        self.conversation
            .as_ref()
            .is_some_and(|active| active.same_identity(conversation))
    }
}

struct StoreInner {
    self_id: UserId,
    gateway: Arc<dyn MessageGateway>,
    transport: Arc<dyn ChannelTransport>,
    notifications: Option<NotificationCenter>,
    outbox: RetryQueue,
    state: Mutex<StoreState>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.state.get_mut().subscription.take() {
            let _ = self.transport.remove(subscription.token);
        }
    }
}

/// State of the conversation surface currently open for the local user.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl ConversationStore {
    pub fn new(
        self_id: UserId,
        gateway: Arc<dyn MessageGateway>,
        transport: Arc<dyn ChannelTransport>,
        notifications: Option<NotificationCenter>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                self_id,
                gateway,
                transport,
                notifications,
                outbox: RetryQueue::new(),
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    pub fn self_id(&self) -> &UserId {
        &self.inner.self_id
    }

    /// Failed sends parked for retry. Shared with the send pipeline.
    pub fn retry_queue(&self) -> &RetryQueue {
        &self.inner.outbox
    }

    /// Finds the conversation with `peer`, or a pending intent if there is
    /// none yet. Never creates a durable conversation.
    pub async fn resolve_conversation(&self, peer: &UserId) -> StoreResult<Conversation> {
        Ok(self
            .inner
            .gateway
            .resolve_conversation(&self.inner.self_id, peer)
            .await?)
    }

    /// Mounts the surface for `peer`: tears down whatever was open, resolves
    /// the conversation, subscribes and loads it.
    pub async fn open(&self, peer: &UserId) -> StoreResult<ConversationView> {
        let generation = self.begin();
        let conversation = self.resolve_conversation(peer).await?;

        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return Err(StoreError::Stale(generation));
            }
            state.conversation = Some(conversation.clone());
        }
        info!(
            peer = %peer,
            conversation = ?conversation.id,
            generation,
            "conversation opened"
        );

        self.restore_failed(generation, &conversation).await?;
        if let Some(id) = &conversation.id {
            self.subscribe(generation, id)?;
            self.load(generation, id).await?;
        }
        Ok(self.snapshot())
    }

    /// Unmounts the surface. Any response still in flight is discarded.
    pub fn close(&self) {
        let generation = self.begin();
        debug!(generation, "conversation closed");
    }

    /// Fetches the active conversation's messages and replaces the list, then
    /// marks the conversation read.
    pub async fn load_messages(&self, id: &ConversationId) -> StoreResult<()> {
        let generation = {
            let state = self.inner.state.lock();
            if state.active_id() != Some(id) {
                return Err(StoreError::NotActive);
            }
            state.generation
        };
        self.load(generation, id).await
    }

    /// Offers a pushed message to the active conversation.
    pub fn apply_incoming(&self, message: Message) -> MergeOutcome {
        if message.sender_id == self.inner.self_id {
            debug!(message = ?message.id, "ignoring push of own message");
            return MergeOutcome::OwnMessage;
        }

        let mut state = self.inner.state.lock();
        let Some(active) = state.active_id() else {
            return MergeOutcome::NoActiveConversation;
        };
        if message.conversation_id.as_ref() != Some(active) {
            debug!(
                message = ?message.id,
                conversation = ?message.conversation_id,
                "ignoring push for another conversation"
            );
            return MergeOutcome::OtherConversation;
        }
        let outcome = state.timeline.merge_remote(message);
        if outcome == MergeOutcome::Duplicate {
            debug!("dropping duplicate push");
        }
        outcome
    }

    pub fn snapshot(&self) -> ConversationView {
        let state = self.inner.state.lock();
        ConversationView {
            conversation: state.conversation.clone(),
            messages: state.timeline.messages(),
            generation: state.generation,
        }
    }

    pub fn active(&self) -> Option<Conversation> {
        self.inner.state.lock().conversation.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Channel the store is currently subscribed to.
    pub fn subscribed_channel(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .subscription
            .as_ref()
            .map(|subscription| conversation_channel(&subscription.conversation))
    }

    /// Re-reads the active conversation after pushes may have been missed.
    /// A pending intent is resolved again in case the peer wrote first.
    pub async fn resync(&self) -> StoreResult<()> {
        let (generation, active) = {
            let state = self.inner.state.lock();
            (state.generation, state.conversation.clone())
        };
        let Some(active) = active else {
            return Ok(());
        };

        let id = match active.id.clone() {
            Some(id) => id,
            None => {
                let Some(peer) = active.peer_of(&self.inner.self_id).cloned() else {
                    return Err(StoreError::NotActive);
                };
                let resolved = self.resolve_conversation(&peer).await?;
                let Some(id) = resolved.id.clone() else {
                    return Ok(());
                };
                if !self.promote_at(generation, &resolved)? {
                    return Err(StoreError::Stale(generation));
                }
                id
            }
        };
        debug!(conversation = %id, generation, "resynchronising conversation");
        self.load(generation, &id).await
    }

    pub(crate) fn insert_local(&self, conversation: &Conversation, message: Message) -> bool {
        let mut state = self.inner.state.lock();
        if !state.is_active(conversation) {
            return false;
        }
        state.timeline.push_local(message);
        true
    }

    /// Swaps the optimistic entry for its confirmed copy. When the entry is
    /// gone because the surface was reopened meanwhile, the confirmed copy is
    /// merged instead.
    pub(crate) fn reconcile(&self, echo: LocalEchoId, confirmed: Message) -> ReconcileOutcome {
        let mut state = self.inner.state.lock();
        let Some(active) = state.active_id() else {
            return ReconcileOutcome::Missing;
        };
        if confirmed.conversation_id.as_ref() != Some(active) {
            return ReconcileOutcome::Missing;
        }
        let outcome = state.timeline.reconcile(echo, confirmed.clone());
        if outcome == ReconcileOutcome::Missing {
            state.timeline.merge_remote(confirmed);
        }
        outcome
    }

    pub(crate) fn set_status(&self, echo: LocalEchoId, status: DeliveryStatus) -> bool {
        self.inner.state.lock().timeline.set_status(echo, status)
    }

    pub(crate) fn remove_local(&self, echo: LocalEchoId) -> Option<Message> {
        self.inner.state.lock().timeline.remove_local(echo)
    }

    /// Records that the active pending intent now has a durable id and
    /// subscribes to it. Returns false when the intent is no longer on screen.
    pub(crate) fn promote(&self, durable: &Conversation) -> StoreResult<bool> {
        let generation = self.generation();
        self.promote_at(generation, durable)
    }

    fn promote_at(&self, generation: u64, durable: &Conversation) -> StoreResult<bool> {
        let Some(id) = durable.id.clone() else {
            return Ok(false);
        };
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation || !state.is_active(durable) {
                return Ok(false);
            }
            let Some(active) = state.conversation.as_mut() else {
                return Ok(false);
            };
            if active.id.is_some() {
                return Ok(true);
            }
            active.id = Some(id.clone());
            state.timeline.assign_conversation(&id);
        }
        info!(conversation = %id, "pending conversation promoted");
        self.subscribe(generation, &id)?;
        Ok(true)
    }

    /// Bumps the generation and tears down the subscription and list of the
    /// previous surface.
    fn begin(&self) -> u64 {
        let (generation, previous) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.conversation = None;
            state.timeline.clear();
            (state.generation, state.subscription.take())
        };
        if let Some(previous) = previous {
            self.release(previous);
        }
        generation
    }

    /// Puts sends to `conversation` that failed and still wait for retry back
    /// on screen as `failed`.
    async fn restore_failed(&self, generation: u64, conversation: &Conversation) -> StoreResult<()> {
        let parked = self.inner.outbox.parked().await;
        let restored = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return Err(StoreError::Stale(generation));
            }
            let mut restored = 0usize;
            for send in parked
                .into_iter()
                .filter(|send| send.conversation.same_identity(conversation))
            {
                if state.timeline.find_local(send.local_echo_id()).is_some() {
                    continue;
                }
                let mut message = send.message;
                message.status = DeliveryStatus::Failed;
                if message.conversation_id.is_none() {
                    message.conversation_id = conversation.id.clone();
                }
                state.timeline.push_local(message);
                restored += 1;
            }
            restored
        };

        if restored > 0 {
            debug!(restored, generation, "failed sends restored");
        }
        Ok(())
    }

    fn subscribe(&self, generation: u64, id: &ConversationId) -> StoreResult<()> {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let token = subscribe_typed::<Message, _>(
            self.inner.transport.as_ref(),
            &conversation_channel(id),
            MESSAGE_EVENT,
            move |message| {
                if let Some(inner) = weak.upgrade() {
                    ConversationStore { inner }.apply_incoming(message);
                }
            },
        )?;

        let replaced = {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.active_id() != Some(id) {
                drop(state);
                let _ = self.inner.transport.remove(token);
                return Err(StoreError::Stale(generation));
            }
            state.subscription.replace(Subscription {
                conversation: id.clone(),
                token,
            })
        };
        if let Some(previous) = replaced {
            self.release(previous);
        }
        debug!(conversation = %id, ?token, "subscribed to conversation");
        Ok(())
    }

    fn release(&self, subscription: Subscription) {
        if let Err(error) = self.inner.transport.remove(subscription.token) {
            warn!(conversation = %subscription.conversation, %error, "failed to unsubscribe");
        } else {
            debug!(conversation = %subscription.conversation, "unsubscribed from conversation");
        }
    }

    async fn load(&self, generation: u64, id: &ConversationId) -> StoreResult<()> {
        let mut messages = self.inner.gateway.list_messages(id).await?;
        messages.sort_by_key(|message| message.created_at);

        {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.active_id() != Some(id) {
                debug!(conversation = %id, generation, "discarding stale message list");
                return Err(StoreError::Stale(generation));
            }
            state.timeline.replace(messages);
        }

        self.mark_read(generation, id).await;
        Ok(())
    }

    async fn mark_read(&self, generation: u64, id: &ConversationId) {
        if self.generation() != generation {
            return;
        }
        if let Err(error) = self.inner.gateway.mark_conversation_read(id).await {
            warn!(conversation = %id, %error, "failed to mark conversation read");
            return;
        }
        if let Some(center) = &self.inner.notifications {
            center.conversation_read(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryGateway, Operation};
    use crate::transport::LocalTransport;
    use chrono::{Duration, Utc};
    use mercato_messaging::MessageId;
    use serde_json::json;

    struct Fixture {
        backend: InMemoryGateway,
        transport: LocalTransport,
        store: ConversationStore,
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn carol() -> UserId {
        UserId::new("carol")
    }

    fn fixture() -> Fixture {
        let backend = InMemoryGateway::new(alice());
        let transport = LocalTransport::new();
        transport.connect().unwrap();
        let store = ConversationStore::new(
            alice(),
            Arc::new(backend.clone()),
            Arc::new(transport.clone()),
            None,
        );
        Fixture {
            backend,
            transport,
            store,
        }
    }

    fn push(transport: &LocalTransport, conversation: &ConversationId, id: &str, from: &UserId) {
        transport.publish(
            &conversation_channel(conversation),
            MESSAGE_EVENT,
            json!({
                "id": id,
                "conversation_id": conversation.as_str(),
                "sender_id": from.as_str(),
                "body": "hi",
                "created_at": Utc::now().to_rfc3339()
            }),
        );
    }

    #[tokio::test]
    async fn open_loads_sorted_history_and_subscribes() {
        let fx = fixture();
        let id = fx.backend.seed_conversation(&alice(), &bob());
        let now = Utc::now();
        fx.backend.seed_message(&id, &bob(), "second", now);
        fx.backend
            .seed_message(&id, &alice(), "first", now - Duration::seconds(30));

        let view = fx.store.open(&bob()).await.unwrap();

        let bodies: Vec<_> = view
            .messages
            .iter()
            .map(|message| message.body.clone().unwrap())
            .collect();
        assert_eq!(bodies, vec!["first", "second"]);
        assert!(fx.transport.is_subscribed(&conversation_channel(&id)));
        assert_eq!(fx.backend.calls(Operation::MarkConversationRead), 1);
    }

    #[tokio::test]
    async fn pending_intent_is_not_subscribed() {
        let fx = fixture();
        let view = fx.store.open(&bob()).await.unwrap();

        assert!(view.conversation.unwrap().is_pending());
        assert!(view.messages.is_empty());
        assert!(fx.transport.active_channels().is_empty());
        assert_eq!(fx.backend.calls(Operation::ListMessages), 0);
    }

    #[tokio::test]
    async fn switching_conversations_moves_the_subscription() {
        let fx = fixture();
        let with_bob = fx.backend.seed_conversation(&alice(), &bob());
        let with_carol = fx.backend.seed_conversation(&alice(), &carol());

        fx.store.open(&bob()).await.unwrap();
        fx.store.open(&carol()).await.unwrap();

        assert_eq!(
            fx.transport.active_channels(),
            vec![conversation_channel(&with_carol)]
        );
        push(&fx.transport, &with_bob, "m-bob", &bob());
        assert!(fx.store.snapshot().messages.is_empty());

        fx.store.close();
        assert!(fx.transport.active_channels().is_empty());
        assert_eq!(fx.transport.handler_count(), 0);
    }

    #[tokio::test]
    async fn pushes_are_deduplicated_and_own_messages_dropped() {
        let fx = fixture();
        let id = fx.backend.seed_conversation(&alice(), &bob());
        fx.store.open(&bob()).await.unwrap();

        push(&fx.transport, &id, "m1", &bob());
        push(&fx.transport, &id, "m1", &bob());
        push(&fx.transport, &id, "m2", &alice());

        let messages = fx.store.snapshot().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, Some(MessageId::new("m1")));
    }

    #[tokio::test]
    async fn apply_incoming_requires_the_active_conversation() {
        let fx = fixture();
        let message = Message {
            id: Some(MessageId::new("m1")),
            conversation_id: Some(ConversationId::new("c-other")),
            sender_id: bob(),
            body: None,
            attachments: vec![],
            created_at: Utc::now(),
            local_echo_id: None,
            status: DeliveryStatus::Confirmed,
        };
        assert_eq!(
            fx.store.apply_incoming(message.clone()),
            MergeOutcome::NoActiveConversation
        );

        fx.backend.seed_conversation(&alice(), &bob());
        fx.store.open(&bob()).await.unwrap();
        assert_eq!(
            fx.store.apply_incoming(message),
            MergeOutcome::OtherConversation
        );
    }

    #[tokio::test]
    async fn stale_load_is_discarded_after_close() {
        let fx = fixture();
        let id = fx.backend.seed_conversation(&alice(), &bob());
        fx.backend.seed_message(&id, &bob(), "late", Utc::now());
        fx.backend.hold(Operation::ListMessages);

        let store = fx.store.clone();
        let opening = tokio::spawn(async move { store.open(&bob()).await });
        while fx.backend.calls(Operation::ListMessages) == 0 {
            tokio::task::yield_now().await;
        }

        fx.store.close();
        fx.backend.release(Operation::ListMessages);

        assert!(matches!(
            opening.await.unwrap(),
            Err(StoreError::Stale(_))
        ));
        let view = fx.store.snapshot();
        assert!(view.conversation.is_none());
        assert!(view.messages.is_empty());
        assert!(fx.transport.active_channels().is_empty());
        assert_eq!(fx.backend.calls(Operation::MarkConversationRead), 0);
    }

    #[tokio::test]
    async fn older_open_cannot_overwrite_newer_one() {
        let fx = fixture();
        let with_bob = fx.backend.seed_conversation(&alice(), &bob());
        let with_carol = fx.backend.seed_conversation(&alice(), &carol());
        fx.backend.seed_message(&with_bob, &bob(), "from bob", Utc::now());
        fx.backend
            .seed_message(&with_carol, &carol(), "from carol", Utc::now());
        fx.backend.hold(Operation::ListMessages);

        let first = fx.store.clone();
        let to_bob = tokio::spawn(async move { first.open(&bob()).await });
        while fx.backend.calls(Operation::ListMessages) < 1 {
            tokio::task::yield_now().await;
        }
        let second = fx.store.clone();
        let to_carol = tokio::spawn(async move { second.open(&carol()).await });
        while fx.backend.calls(Operation::ListMessages) < 2 {
            tokio::task::yield_now().await;
        }
        fx.backend.release(Operation::ListMessages);

        assert!(matches!(to_bob.await.unwrap(), Err(StoreError::Stale(_))));
        let view = to_carol.await.unwrap().unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].body.as_deref(), Some("from carol"));
        assert_eq!(
            fx.transport.active_channels(),
            vec![conversation_channel(&with_carol)]
        );
    }

    #[tokio::test]
    async fn resync_picks_up_a_conversation_the_peer_started() {
        let fx = fixture();
        fx.store.open(&bob()).await.unwrap();

        let bob_session = fx.backend.session(bob());
        bob_session
            .send_message(mercato_messaging::wire::OutgoingMessage {
                target: mercato_messaging::wire::SendTarget::Peer(alice()),
                body: Some("are you there?".into()),
                attachments: vec![],
                local_echo_id: LocalEchoId::new(),
            })
            .await
            .unwrap();

        fx.store.resync().await.unwrap();
        let view = fx.store.snapshot();
        let conversation = view.conversation.unwrap();
        assert!(!conversation.is_pending());
        assert_eq!(view.messages.len(), 1);
        assert!(fx
            .transport
            .is_subscribed(&conversation_channel(&conversation.id.unwrap())));
    }

    #[tokio::test]
    async fn load_messages_requires_the_active_conversation() {
        let fx = fixture();
        assert!(matches!(
            fx.store.load_messages(&ConversationId::new("c1")).await,
            Err(StoreError::NotActive)
        ));
    }
}
