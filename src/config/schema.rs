//! Configuration schema definitions.
//!
//! This module defines the endpoint configuration structure. All types
//! derive Serde traits for deserialization from config files, and every
//! field has a default so a minimal config is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for an endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EndpointConfig {
    /// Channel multiplexing limits and deadlines.
    pub channels: ChannelConfig,

    /// Identity and authentication settings.
    pub identity: IdentityConfig,

    /// Re-establishment policy for managed connections.
    pub reconnect: ReconnectConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Channel multiplexing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum concurrent channels per connection.
    pub max_per_connection: usize,

    /// Channel-open deadline in seconds.
    pub open_timeout_secs: u64,
}

impl ChannelConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_per_connection: 64,
            open_timeout_secs: 10,
        }
    }
}

/// Identity resolution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Whether the reserved anonymous identity may be asserted.
    pub anonymous_enabled: bool,

    /// Authentication round-trip deadline in seconds.
    pub auth_timeout_secs: u64,
}

impl IdentityConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            anonymous_enabled: true,
            auth_timeout_secs: 10,
        }
    }
}

/// Managed-connection re-establishment configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum dial attempts per re-establishment.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: EndpointConfig = toml::from_str("").unwrap();
        assert_eq!(config.channels.max_per_connection, 64);
        assert!(config.identity.anonymous_enabled);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn sections_override_independently() {
        let config: EndpointConfig = toml::from_str(
            r#"
            [channels]
            max_per_connection = 4

            [identity]
            anonymous_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.channels.max_per_connection, 4);
        assert!(!config.identity.anonymous_enabled);
        assert_eq!(config.channels.open_timeout(), Duration::from_secs(10));
    }
}
