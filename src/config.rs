//! Client configuration
//!
//! Loaded from environment variables, falling back to defaults for anything
//! missing or unparseable.

use std::env;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3016";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub relay: RelayConfig,
    pub session: SessionConfig,
}

/// Signaling connection settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server_url: String,
    /// First reconnect delay; doubled on every failed attempt
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

/// Session-level timing and limits
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a server acknowledgement
    pub ack_timeout: Duration,
    pub consume_retry_base: Duration,
    pub consume_retry_max_attempts: u32,
    pub audio_channels: u8,
    pub chat_history_limit: usize,
    /// Capacity of the session's inbound event channel
    pub inbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect_base_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(10),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            consume_retry_base: Duration::from_millis(200),
            consume_retry_max_attempts: 6,
            audio_channels: 1,
            chat_history_limit: 200,
            inbound_buffer: 1024,
        }
    }
}

impl SessionConfig {
    /// Delay before the given consume retry attempt (1-based)
    pub fn consume_retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.consume_retry_base.saturating_mul(1u32 << exp)
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("STAGECALL_SERVER_URL")
            && !url.is_empty()
        {
            config.relay.server_url = url;
        }
        if let Ok(val) = env::var("STAGECALL_RECONNECT_MAX_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.relay.reconnect_max_delay = Duration::from_secs(secs);
        }

        if let Ok(val) = env::var("STAGECALL_ACK_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            config.session.ack_timeout = Duration::from_millis(ms);
        }
        if let Ok(val) = env::var("STAGECALL_CONSUME_RETRIES")
            && let Ok(n) = val.parse()
        {
            config.session.consume_retry_max_attempts = n;
        }
        if let Ok(val) = env::var("STAGECALL_AUDIO_CHANNELS")
            && let Ok(n) = val.parse()
        {
            config.session.audio_channels = n;
        }

        config
    }
}
