use std::time::Duration;

use crate::calls::{CallManagerConfig, MediaConstraints};

pub const DEFAULT_RELAY_URL: &str = "http://localhost:5000";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

pub const ENV_RELAY_URL: &str = "CALLWAVE_RELAY_URL";
pub const ENV_DISPLAY_NAME: &str = "CALLWAVE_DISPLAY_NAME";
pub const ENV_ICE_SERVERS: &str = "CALLWAVE_ICE_SERVERS";

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub relay: RelayConfig,
    /// Name to start with; can be changed until a call is placed or answered.
    pub display_name: Option<String>,
    /// What to request from the media source at startup.
    pub media: MediaConstraints,
    pub calls: CallManagerConfig,
    /// STUN/TURN urls for the negotiator.
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            display_name: None,
            media: MediaConstraints::default(),
            calls: CallManagerConfig::default(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `CALLWAVE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_RELAY_URL).filter(|v| !v.trim().is_empty()) {
            config.relay.url = url.trim().to_string();
        }
        if let Some(name) = lookup(ENV_DISPLAY_NAME) {
            config.display_name = Some(name);
        }
        if let Some(servers) = lookup(ENV_ICE_SERVERS) {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Base url of the signaling server (`http(s)://` or `ws(s)://`).
    pub url: String,
    pub reconnect: ReconnectConfig,
    /// Emits held back while the channel is not joined. Oldest are dropped first.
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            outbound_buffer: 64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    /// Backoff before retry number `attempt` (1-based): doubles each time,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}
