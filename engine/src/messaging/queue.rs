//! Failed sends waiting for a user-triggered retry.

use mercato_messaging::wire::OutgoingMessage;
use mercato_messaging::{Conversation, LocalEchoId, Message};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct ParkedSend {
    /// Conversation as it was known when the send was issued.
    pub conversation: Conversation,
    pub request: OutgoingMessage,
    pub attempts: u32,
    /// The failed local copy, shown again whenever its conversation reopens.
    pub message: Message,
}

impl ParkedSend {
    pub fn local_echo_id(&self) -> LocalEchoId {
        self.request.local_echo_id
    }
}

/// In-memory queue of failed sends, oldest first.
#[derive(Clone, Default)]
pub struct RetryQueue {
    queue: Arc<RwLock<VecDeque<ParkedSend>>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a failed send. A send parked again under the same echo id keeps
    /// its place in the queue.
    pub async fn park(
        &self,
        conversation: Conversation,
        request: OutgoingMessage,
        message: Message,
        attempts: u32,
    ) {
        let parked = ParkedSend {
            conversation,
            request,
            attempts,
            message,
        };

        let mut queue = self.queue.write().await;
        match queue
            .iter_mut()
            .find(|existing| existing.local_echo_id() == parked.local_echo_id())
        {
            Some(existing) => *existing = parked,
            None => queue.push_back(parked),
        }
    }

    /// Removes and returns the send parked under `echo`.
    pub async fn take(&self, echo: LocalEchoId) -> Option<ParkedSend> {
        let mut queue = self.queue.write().await;
        let position = queue
            .iter()
            .position(|parked| parked.local_echo_id() == echo)?;
        queue.remove(position)
    }

    pub async fn contains(&self, echo: LocalEchoId) -> bool {
        self.queue
            .read()
            .await
            .iter()
            .any(|parked| parked.local_echo_id() == echo)
    }

    pub async fn parked(&self) -> Vec<ParkedSend> {
        self.queue.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.read().await.is_empty()
    }
}
