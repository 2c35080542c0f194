use super::{TransportError, TransportResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback invoked with the raw JSON payload of a pushed event.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle for exactly one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Registration {
    token: SubscriptionToken,
    event: String,
    handler: EventHandler,
}

#[derive(Default)]
struct RegistryState {
    next_token: u64,
    channels: HashMap<String, Vec<Registration>>,
}

/// Channel → handler table shared by the transport implementations.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler. The flag is true when this is the first registration
    /// on the channel, i.e. the connection has to join it.
    pub fn register(
        &self,
        channel: &str,
        event: &str,
        handler: EventHandler,
    ) -> TransportResult<(SubscriptionToken, bool)> {
        let mut state = self.state()?;
        state.next_token += 1;
        let token = SubscriptionToken(state.next_token);
        let registrations = state.channels.entry(channel.to_owned()).or_default();
        let first = registrations.is_empty();
        registrations.push(Registration {
            token,
            event: event.to_owned(),
            handler,
        });
        Ok((token, first))
    }

    /// Drops every handler on `channel`; returns whether there were any.
    pub fn remove_channel(&self, channel: &str) -> TransportResult<bool> {
        Ok(self.state()?.channels.remove(channel).is_some())
    }

    /// Drops one registration. Returns the channel it belonged to when that
    /// channel has no handlers left.
    pub fn remove(&self, token: SubscriptionToken) -> TransportResult<Option<String>> {
        let mut state = self.state()?;
        let mut emptied = None;
        for (channel, registrations) in state.channels.iter_mut() {
            let before = registrations.len();
            registrations.retain(|registration| registration.token != token);
            if registrations.len() != before {
                if registrations.is_empty() {
                    emptied = Some(channel.clone());
                }
                break;
            }
        }
        if let Some(channel) = &emptied {
            state.channels.remove(channel);
        }
        Ok(emptied)
    }

    pub fn clear(&self) -> TransportResult<()> {
        self.state()?.channels.clear();
        Ok(())
    }

    pub fn channels(&self) -> TransportResult<Vec<String>> {
        let mut channels: Vec<String> = self.state()?.channels.keys().cloned().collect();
        channels.sort();
        Ok(channels)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.state()
            .map(|state| state.channels.contains_key(channel))
            .unwrap_or(false)
    }

    pub fn handler_count(&self) -> usize {
        self.state()
            .map(|state| state.channels.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Invokes every handler registered for `event` on `channel` and returns
    /// how many ran. Handlers run outside the registry lock so they may
    /// subscribe or unsubscribe themselves.
    pub fn dispatch(&self, channel: &str, event: &str, payload: &Value) -> TransportResult<usize> {
        let handlers: Vec<EventHandler> = {
            let state = self.state()?;
            match state.channels.get(channel) {
                Some(registrations) => registrations
                    .iter()
                    .filter(|registration| registration.event == event)
                    .map(|registration| registration.handler.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        for handler in &handlers {
            handler(payload);
        }
        Ok(handlers.len())
    }

    fn state(&self) -> TransportResult<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| TransportError::Subscription("lock poisoned".into()))
    }
}
