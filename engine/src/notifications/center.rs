use super::poller::spawn_poller;
use super::{NotificationError, NotificationResult};
use crate::gateway::NotificationGateway;
use crate::transport::{subscribe_typed, ChannelTransport, SubscriptionToken, TransportError};
use futures::future::join_all;
use mercato_messaging::wire::{notifications_channel, NotificationPage, NOTIFICATION_EVENT};
use mercato_messaging::{
    ConversationId, CounterKind, Notification, NotificationId, NotificationKind, UserId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Values of every unread counter at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub messages: u64,
    pub activity: u64,
}

impl CounterSnapshot {
    pub fn get(&self, kind: CounterKind) -> u64 {
        match kind {
            CounterKind::Messages => self.messages,
            CounterKind::Activity => self.activity,
        }
    }

    pub fn total(&self) -> u64 {
        self.messages.saturating_add(self.activity)
    }
}

#[derive(Debug, Default)]
struct CounterSlot {
    value: u64,
    next_ticket: u64,
    last_applied: u64,
    /// Number of server counts applied so far.
    refreshes: u64,
}

impl CounterSlot {
    fn issue(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Applies a server count unless a newer write landed since `ticket` was
    /// issued.
    fn apply_refresh(&mut self, ticket: u64, value: u64) -> bool {
        if ticket <= self.last_applied {
            return false;
        }
        self.value = value;
        self.last_applied = ticket;
        self.refreshes += 1;
        true
    }

    fn write_local(&mut self, value: u64) {
        self.last_applied = self.issue();
        self.value = value;
    }
}

#[derive(Default)]
struct CenterState {
    messages: CounterSlot,
    activity: CounterSlot,
    items: HashMap<CounterKind, Vec<Notification>>,
}

impl CenterState {
    fn slot_mut(&mut self, kind: CounterKind) -> &mut CounterSlot {
        match kind {
            CounterKind::Messages => &mut self.messages,
            CounterKind::Activity => &mut self.activity,
        }
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages: self.messages.value,
            activity: self.activity.value,
        }
    }

    fn find_mut(&mut self, id: &NotificationId) -> Option<&mut Notification> {
        self.items
            .values_mut()
            .flat_map(|items| items.iter_mut())
            .find(|item| &item.id == id)
    }
}

/// Merges fetched or pushed notifications, newest first. Read state only
/// moves from unread to read.
fn merge_items(items: &mut Vec<Notification>, incoming: impl IntoIterator<Item = Notification>) {
    for notification in incoming {
        match items.iter_mut().find(|existing| existing.id == notification.id) {
            Some(existing) => {
                let was_read = existing.is_read;
                *existing = notification;
                existing.is_read |= was_read;
            }
            None => items.push(notification),
        }
    }
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

struct PushBinding {
    transport: Arc<dyn ChannelTransport>,
    token: SubscriptionToken,
    pump: JoinHandle<()>,
}

impl PushBinding {
    fn release(self) {
        if let Err(error) = self.transport.remove(self.token) {
            warn!(%error, "failed to unsubscribe notification channel");
        }
        self.pump.abort();
    }
}

struct CenterInner {
    gateway: Arc<dyn NotificationGateway>,
    poll_interval: Duration,
    state: Mutex<CenterState>,
    counters_tx: watch::Sender<CounterSnapshot>,
    poller: Mutex<Option<JoinHandle<()>>>,
    push: Mutex<Option<PushBinding>>,
}

impl Drop for CenterInner {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.abort();
        }
        if let Some(binding) = self.push.get_mut().take() {
            binding.release();
        }
    }
}

/// Owner of the unread counters and the loaded notification lists.
///
/// Nothing else mutates counters. Clones share state.
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<CenterInner>,
}

impl NotificationCenter {
    pub fn new(gateway: Arc<dyn NotificationGateway>, poll_interval: Duration) -> Self {
        let (counters_tx, _rx) = watch::channel(CounterSnapshot::default());
        Self {
            inner: Arc::new(CenterInner {
                gateway,
                poll_interval,
                state: Mutex::new(CenterState::default()),
                counters_tx,
                poller: Mutex::new(None),
                push: Mutex::new(None),
            }),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    pub fn counter(&self, kind: CounterKind) -> u64 {
        self.counters().get(kind)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.inner.state.lock().snapshot()
    }

    /// Loaded notifications of `kind`, newest first.
    pub fn items(&self, kind: CounterKind) -> Vec<Notification> {
        self.inner
            .state
            .lock()
            .items
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Receives a snapshot after every counter change.
    pub fn watch_counters(&self) -> watch::Receiver<CounterSnapshot> {
        self.inner.counters_tx.subscribe()
    }

    /// Replaces the counter with the server's count and returns the counter
    /// value afterwards.
    pub async fn refresh_unread_count(&self, kind: CounterKind) -> NotificationResult<u64> {
        let ticket = self.inner.state.lock().slot_mut(kind).issue();
        let count = self.inner.gateway.unread_count(kind).await?;

        let (applied, snapshot) = {
            let mut state = self.inner.state.lock();
            let applied = state.slot_mut(kind).apply_refresh(ticket, count);
            (applied, state.snapshot())
        };
        if applied {
            debug!(%kind, count, "unread counter refreshed");
            self.publish(snapshot);
        } else {
            debug!(%kind, count, ticket, "discarding superseded unread count");
        }
        Ok(snapshot.get(kind))
    }

    /// Refreshes every counter. All kinds are attempted even if one fails.
    pub async fn refresh_all(&self) -> NotificationResult<CounterSnapshot> {
        let results = join_all(
            CounterKind::ALL
                .into_iter()
                .map(|kind| self.refresh_unread_count(kind)),
        )
        .await;

        let mut first_error = None;
        for (kind, result) in CounterKind::ALL.into_iter().zip(results) {
            if let Err(error) = result {
                warn!(%kind, %error, "unread counter refresh failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(self.counters()),
        }
    }

    /// Fetches one page and merges it into the loaded items. Marks nothing
    /// read.
    pub async fn list_recent(
        &self,
        kind: CounterKind,
        page: u32,
    ) -> NotificationResult<NotificationPage> {
        let fetched = self.inner.gateway.list_notifications(kind, page).await?;
        let mut state = self.inner.state.lock();
        merge_items(state.items.entry(kind).or_default(), fetched.data.iter().cloned());
        Ok(fetched)
    }

    /// Marks one notification read.
    ///
    /// The item flips and its counter drops by one (never below zero) before
    /// the durable call. If the call fails both are restored, unless a server
    /// count arrived meanwhile, in which case that count stands.
    pub async fn mark_read(&self, id: &NotificationId) -> NotificationResult<()> {
        let (kind, decremented, refreshes, snapshot) = {
            let mut state = self.inner.state.lock();
            let Some(item) = state.find_mut(id) else {
                return Err(NotificationError::UnknownNotification(id.clone()));
            };
            if item.is_read {
                return Ok(());
            }
            item.is_read = true;
            let kind = item.counter();

            let slot = state.slot_mut(kind);
            let decremented = slot.value > 0;
            slot.write_local(slot.value.saturating_sub(1));
            let refreshes = slot.refreshes;
            (kind, decremented, refreshes, state.snapshot())
        };
        self.publish(snapshot);

        match self.inner.gateway.mark_read(id).await {
            Ok(()) => {
                debug!(%id, %kind, "notification marked read");
                Ok(())
            }
            Err(error) => {
                warn!(%id, %kind, %error, "mark read failed, rolling back");
                let snapshot = {
                    let mut state = self.inner.state.lock();
                    if let Some(item) = state.find_mut(id) {
                        item.is_read = false;
                    }
                    let slot = state.slot_mut(kind);
                    if decremented && slot.refreshes == refreshes {
                        slot.value += 1;
                    }
                    state.snapshot()
                };
                self.publish(snapshot);
                Err(error.into())
            }
        }
    }

    /// Marks every notification of `kind` read.
    ///
    /// The counter drops to zero and loaded items flip before the durable
    /// call. On failure the counter and the first page are re-read from the
    /// server.
    pub async fn mark_all_read(&self, kind: CounterKind) -> NotificationResult<()> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.slot_mut(kind).write_local(0);
            if let Some(items) = state.items.get_mut(&kind) {
                for item in items.iter_mut() {
                    item.is_read = true;
                }
            }
            state.snapshot()
        };
        self.publish(snapshot);

        match self.inner.gateway.mark_all_read(kind).await {
            Ok(()) => {
                info!(%kind, "all notifications marked read");
                Ok(())
            }
            Err(error) => {
                warn!(%kind, %error, "mark all read failed, resynchronising");
                self.resync(kind).await;
                Err(error.into())
            }
        }
    }

    /// Handles a notification pushed on the user's channel: records it and
    /// re-reads its counter.
    pub async fn apply_pushed(&self, notification: Notification) -> NotificationResult<u64> {
        let kind = notification.counter();
        debug!(id = %notification.id, %kind, "notification pushed");
        {
            let mut state = self.inner.state.lock();
            merge_items(state.items.entry(kind).or_default(), [notification]);
        }
        self.refresh_unread_count(kind).await
    }

    /// Called once a conversation has been marked read on the server.
    pub async fn conversation_read(&self, conversation: &ConversationId) {
        {
            let mut state = self.inner.state.lock();
            if let Some(items) = state.items.get_mut(&CounterKind::Messages) {
                for item in items.iter_mut().filter(|item| {
                    item.kind == NotificationKind::Message
                        && item.subject_ref.as_deref() == Some(conversation.as_str())
                }) {
                    item.is_read = true;
                }
            }
        }
        if let Err(error) = self.refresh_unread_count(CounterKind::Messages).await {
            warn!(%conversation, %error, "message counter refresh failed");
        }
    }

    /// Listens on `user`'s notification channel. Replaces any previous
    /// binding. Must be called from within a Tokio runtime.
    pub fn attach_push(
        &self,
        transport: Arc<dyn ChannelTransport>,
        user: &UserId,
    ) -> NotificationResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connection(format!("no async runtime: {e}")))?;
        self.detach_push();

        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let token = subscribe_typed::<Notification, _>(
            transport.as_ref(),
            &notifications_channel(user),
            NOTIFICATION_EVENT,
            move |notification| {
                let _ = tx.send(notification);
            },
        )?;

        let weak = Arc::downgrade(&self.inner);
        let pump = runtime.spawn(async move {
            while let Some(notification) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let center = NotificationCenter { inner };
                if let Err(error) = center.apply_pushed(notification).await {
                    warn!(%error, "counter refresh after push failed");
                }
            }
        });

        *self.inner.push.lock() = Some(PushBinding {
            transport,
            token,
            pump,
        });
        info!(user = %user, "notification push attached");
        Ok(())
    }

    pub fn detach_push(&self) {
        let binding = self.inner.push.lock().take();
        if let Some(binding) = binding {
            binding.release();
            debug!("notification push detached");
        }
    }

    /// Starts periodic refreshes of every counter. Returns false if polling
    /// is already running. Fails outside a Tokio runtime.
    pub fn start_polling(&self) -> NotificationResult<bool> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connection(format!("no async runtime: {e}")))?;
        let mut poller = self.inner.poller.lock();
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }

        let weak = Arc::downgrade(&self.inner);
        *poller = Some(spawn_poller(&runtime, self.inner.poll_interval, move || {
            let inner = weak.upgrade()?;
            Some(async move {
                let center = NotificationCenter { inner };
                if let Err(error) = center.refresh_all().await {
                    debug!(%error, "poll refresh incomplete");
                }
            })
        }));
        info!(interval = ?self.inner.poll_interval, "notification polling started");
        Ok(true)
    }

    /// Stops polling. Returns false if it was not running.
    pub fn stop_polling(&self) -> bool {
        match self.inner.poller.lock().take() {
            Some(handle) => {
                handle.abort();
                info!("notification polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn resync(&self, kind: CounterKind) {
        if let Err(error) = self.refresh_unread_count(kind).await {
            warn!(%kind, %error, "counter resync failed");
        }
        match self.inner.gateway.list_notifications(kind, 1).await {
            Ok(page) => {
                let mut items = page.data;
                items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.inner.state.lock().items.insert(kind, items);
            }
            Err(error) => warn!(%kind, %error, "notification list resync failed"),
        }
    }

    fn publish(&self, snapshot: CounterSnapshot) {
        self.inner.counters_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryGateway, MessageGateway, Operation};
    use crate::transport::LocalTransport;

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn setup() -> (InMemoryGateway, NotificationCenter) {
        let backend = InMemoryGateway::new(alice());
        let center = NotificationCenter::new(Arc::new(backend.clone()), DEFAULT_POLL_INTERVAL);
        (backend, center)
    }

    async fn load_activity(backend: &InMemoryGateway, center: &NotificationCenter, count: usize) {
        for _ in 0..count {
            backend.notify(&alice(), NotificationKind::Like, &bob(), Some("post-1"));
        }
        center.list_recent(CounterKind::Activity, 1).await.unwrap();
        center
            .refresh_unread_count(CounterKind::Activity)
            .await
            .unwrap();
    }

    #[test]
    fn superseded_refreshes_are_discarded() {
        let mut slot = CounterSlot::default();
        let early = slot.issue();
        slot.write_local(0);
        assert!(!slot.apply_refresh(early, 5));
        assert_eq!(slot.value, 0);

        let late = slot.issue();
        assert!(slot.apply_refresh(late, 3));
        assert_eq!(slot.value, 3);
        assert_eq!(slot.refreshes, 1);
    }

    #[test]
    fn merging_never_unreads() {
        let mut items = Vec::new();
        let mut read = Notification {
            id: NotificationId::new("n1"),
            kind: NotificationKind::Reply,
            actor_id: bob(),
            subject_ref: None,
            is_read: true,
            created_at: chrono::Utc::now(),
        };
        merge_items(&mut items, [read.clone()]);
        read.is_read = false;
        merge_items(&mut items, [read]);
        assert_eq!(items.len(), 1);
        assert!(items[0].is_read);
    }

    #[tokio::test]
    async fn refresh_replaces_counter_and_notifies_watchers() {
        let (backend, center) = setup();
        let mut watch = center.watch_counters();
        for _ in 0..3 {
            backend.notify(&alice(), NotificationKind::Comment, &bob(), None);
        }

        assert_eq!(center.refresh_unread_count(CounterKind::Activity).await.unwrap(), 3);
        assert!(watch.has_changed().unwrap());
        assert_eq!(watch.borrow_and_update().activity, 3);
        assert_eq!(center.counter(CounterKind::Messages), 0);
    }

    #[tokio::test]
    async fn mark_read_decrements_once() {
        let (backend, center) = setup();
        load_activity(&backend, &center, 2).await;
        let first = center.items(CounterKind::Activity)[0].id.clone();

        center.mark_read(&first).await.unwrap();
        center.mark_read(&first).await.unwrap();

        assert_eq!(center.counter(CounterKind::Activity), 1);
        assert_eq!(backend.calls(Operation::MarkRead), 1);
        assert!(center.items(CounterKind::Activity)[0].is_read);
    }

    #[tokio::test]
    async fn failed_mark_read_rolls_back_exactly() {
        let (backend, center) = setup();
        load_activity(&backend, &center, 2).await;
        let first = center.items(CounterKind::Activity)[0].id.clone();
        backend.fail(Operation::MarkRead);

        assert!(matches!(
            center.mark_read(&first).await,
            Err(NotificationError::Gateway(_))
        ));
        assert_eq!(center.counter(CounterKind::Activity), 2);
        assert!(!center.items(CounterKind::Activity)[0].is_read);
    }

    #[tokio::test]
    async fn counter_never_goes_negative() {
        let (backend, center) = setup();
        backend.notify(&alice(), NotificationKind::Follow, &bob(), None);
        center.list_recent(CounterKind::Activity, 1).await.unwrap();
        let id = center.items(CounterKind::Activity)[0].id.clone();
        backend.fail(Operation::MarkRead);

        assert!(center.mark_read(&id).await.is_err());
        assert_eq!(center.counter(CounterKind::Activity), 0);

        backend.heal(Operation::MarkRead);
        center.mark_read(&id).await.unwrap();
        assert_eq!(center.counter(CounterKind::Activity), 0);
    }

    #[tokio::test]
    async fn unknown_notifications_are_rejected() {
        let (_backend, center) = setup();
        assert!(matches!(
            center.mark_read(&NotificationId::new("missing")).await,
            Err(NotificationError::UnknownNotification(_))
        ));
    }

    #[tokio::test]
    async fn mark_all_read_zeroes_and_flips_items() {
        let (backend, center) = setup();
        load_activity(&backend, &center, 5).await;
        assert_eq!(center.counter(CounterKind::Activity), 5);

        center.mark_all_read(CounterKind::Activity).await.unwrap();

        assert_eq!(center.counter(CounterKind::Activity), 0);
        assert!(center
            .items(CounterKind::Activity)
            .iter()
            .all(|item| item.is_read));
        assert_eq!(backend.unread_count(CounterKind::Activity).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_mark_all_read_resyncs_from_server() {
        let (backend, center) = setup();
        load_activity(&backend, &center, 5).await;
        backend.fail(Operation::MarkAllRead);
        backend.notify(&alice(), NotificationKind::Reply, &bob(), None);

        assert!(center.mark_all_read(CounterKind::Activity).await.is_err());

        assert_eq!(center.counter(CounterKind::Activity), 6);
        let items = center.items(CounterKind::Activity);
        assert_eq!(items.len(), 6);
        assert!(items.iter().all(|item| !item.is_read));
    }

    #[tokio::test]
    async fn pushed_notifications_refresh_their_counter() {
        let (backend, center) = setup();
        let transport = LocalTransport::new();
        transport.connect().unwrap();
        backend.broadcast_via(transport.clone());
        center
            .attach_push(Arc::new(transport.clone()), &alice())
            .unwrap();
        let mut watch = center.watch_counters();

        backend.notify(&alice(), NotificationKind::Message, &bob(), Some("c1"));

        tokio::time::timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watch.borrow().messages, 1);
        assert_eq!(center.items(CounterKind::Messages).len(), 1);

        center.detach_push();
        assert!(!transport.is_subscribed(&notifications_channel(&alice())));
    }

    #[tokio::test]
    async fn conversation_read_refreshes_message_counter() {
        let (backend, center) = setup();
        backend.notify(&alice(), NotificationKind::Message, &bob(), Some("c1"));
        center.list_recent(CounterKind::Messages, 1).await.unwrap();
        center.refresh_all().await.unwrap();
        assert_eq!(center.counter(CounterKind::Messages), 1);

        backend
            .mark_conversation_read(&ConversationId::new("c1"))
            .await
            .unwrap();
        center.conversation_read(&ConversationId::new("c1")).await;

        assert_eq!(center.counter(CounterKind::Messages), 0);
        assert!(center.items(CounterKind::Messages)[0].is_read);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_is_idempotent_and_stoppable() {
        let (backend, center) = setup();

        assert!(center.start_polling().unwrap());
        assert!(!center.start_polling().unwrap());
        assert!(center.is_polling());

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(backend.calls(Operation::UnreadCount), 8);

        assert!(center.stop_polling());
        assert!(!center.stop_polling());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.calls(Operation::UnreadCount), 8);
    }

    #[test]
    fn polling_outside_a_runtime_is_an_error() {
        let (backend, center) = setup();
        assert!(matches!(
            center.start_polling(),
            Err(NotificationError::Transport(_))
        ));
        assert!(!center.is_polling());
        assert_eq!(backend.calls(Operation::UnreadCount), 0);
    }
}
