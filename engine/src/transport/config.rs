use std::time::Duration;

/// Backoff between reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Factor applied after every failed attempt.
    pub multiplier: u32,
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

/// Configuration for the websocket push transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Sent as a bearer token during the handshake.
    pub auth_token: Option<String>,
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}
