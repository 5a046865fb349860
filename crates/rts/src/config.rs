//! Service configuration

use anyhow::Result;
use rts_lib::service::ServiceSettings;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Real-time service configuration, read from `RTS_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct RtsConfig {
    /// Identity of this instance, also its reply routing key
    #[serde(default = "default_service_id")]
    pub service_id: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Upper bound on the wait for a translator reply
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// Pause before re-declaring a lost subscription
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Background tasks draining the publish queue
    #[serde(default = "default_sender_count")]
    pub sender_count: usize,

    /// Broker TTL of published fetch requests
    #[serde(default = "default_message_ttl")]
    pub message_ttl_ms: u64,

    /// Write background poll results to the time-series store
    #[serde(default)]
    pub history_enabled: bool,
}

/// Floor of the reconnect delay, keeps a down broker from being hammered
const MIN_RECONNECT_DELAY_MS: u64 = 100;

fn default_service_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("rts-{}", &suffix[..8])
    })
}

fn default_api_port() -> u16 {
    8080
}

fn default_fetch_timeout() -> u64 {
    25_000
}

fn default_reconnect_delay() -> u64 {
    5_000
}

fn default_sender_count() -> usize {
    2
}

fn default_message_ttl() -> u64 {
    30_000
}

impl Default for RtsConfig {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            api_port: default_api_port(),
            fetch_timeout_ms: default_fetch_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            sender_count: default_sender_count(),
            message_ttl_ms: default_message_ttl(),
            history_enabled: false,
        }
    }
}

impl RtsConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("RTS"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid RTS_* configuration, using defaults");
            RtsConfig::default()
        }))
    }

    /// Settings of the real-time core
    pub fn settings(&self) -> ServiceSettings {
        let mut settings = ServiceSettings::new(self.service_id.clone());
        if self.reconnect_delay_ms < MIN_RECONNECT_DELAY_MS {
            warn!(
                reconnect_delay_ms = self.reconnect_delay_ms,
                min_ms = MIN_RECONNECT_DELAY_MS,
                "Reconnect delay too short, raising it"
            );
        }
        settings.channel.reconnect_delay =
            Duration::from_millis(self.reconnect_delay_ms.max(MIN_RECONNECT_DELAY_MS));
        settings.channel.sender_count = self.sender_count;
        settings.resolver = settings
            .resolver
            .with_fetch_timeout(Duration::from_millis(self.fetch_timeout_ms))
            .with_message_ttl(Duration::from_millis(self.message_ttl_ms));
        settings.history_enabled = self.history_enabled;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RtsConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.fetch_timeout_ms, 25_000);
        assert!(!config.history_enabled);
    }

    #[test]
    fn test_settings_carry_timings() {
        let config = RtsConfig {
            service_id: "rts-a".to_string(),
            fetch_timeout_ms: 1_000,
            reconnect_delay_ms: 200,
            ..RtsConfig::default()
        };
        let settings = config.settings();
        assert_eq!(settings.service_id, "rts-a");
        assert_eq!(settings.resolver.reply_routing_key, "rts-a");
        assert_eq!(settings.resolver.fetch_timeout, Duration::from_secs(1));
        assert_eq!(settings.channel.reconnect_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_reconnect_delay_has_a_floor() {
        let config = RtsConfig {
            reconnect_delay_ms: 0,
            ..RtsConfig::default()
        };
        assert_eq!(
            config.settings().channel.reconnect_delay,
            Duration::from_millis(MIN_RECONNECT_DELAY_MS)
        );
    }
}
