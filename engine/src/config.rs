use crate::notifications::DEFAULT_POLL_INTERVAL;
use crate::transport::{ReconnectPolicy, TransportConfig};
use anyhow::{bail, Context};
use std::env;
use std::time::Duration;

/// Runtime configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the HTTP API.
    pub api_base_url: String,
    /// Websocket endpoint for pushed events.
    pub push_url: String,
    /// Opaque bearer token issued by the session layer.
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api".into(),
            push_url: "ws://127.0.0.1:8080/push".into(),
            auth_token: None,
            request_timeout: Duration::from_secs(10),
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup("MERCATO_API_URL") {
            config.api_base_url = url;
        }
        if let Some(url) = lookup("MERCATO_PUSH_URL") {
            config.push_url = url;
        }
        config.auth_token = lookup("MERCATO_API_TOKEN").filter(|token| !token.is_empty());
        if let Some(secs) = seconds(&lookup, "MERCATO_POLL_INTERVAL_SECS")? {
            if secs == 0 {
                bail!("MERCATO_POLL_INTERVAL_SECS must be at least 1");
            }
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = seconds(&lookup, "MERCATO_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = url.into();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Settings for the websocket push transport.
    pub fn transport(&self) -> TransportConfig {
        let config = TransportConfig::new(self.push_url.clone()).with_reconnect(self.reconnect.clone());
        match &self.auth_token {
            Some(token) => config.with_auth_token(token.clone()),
            None => config,
        }
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<u64>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(config.auth_token.is_none());
        assert!(config.transport().auth_token.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MERCATO_API_URL", "https://api.mercato.test/v1"),
            ("MERCATO_PUSH_URL", "wss://push.mercato.test"),
            ("MERCATO_API_TOKEN", "tok"),
            ("MERCATO_POLL_INTERVAL_SECS", " 5 "),
            ("MERCATO_REQUEST_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "https://api.mercato.test/v1");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(3));

        let transport = config.transport();
        assert_eq!(transport.url, "wss://push.mercato.test");
        assert_eq!(transport.auth_token.as_deref(), Some("tok"));
    }

    #[test]
    fn rejects_bad_intervals() {
        let error = EngineConfig::from_lookup(lookup(&[("MERCATO_POLL_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(error.to_string().contains("MERCATO_POLL_INTERVAL_SECS"));

        assert!(
            EngineConfig::from_lookup(lookup(&[("MERCATO_POLL_INTERVAL_SECS", "0")])).is_err()
        );
    }
}
