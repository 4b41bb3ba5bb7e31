//! Pool and relay configuration.
//!
//! Both structs deserialize from JSON or TOML with durations given in milliseconds,
//! and every field falls back to its default when omitted.

use std::time::Duration;

use serde::Deserialize;

/// Relay connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Connection timeout
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Delay before the single reconnect attempt after a disconnect
    #[serde(rename = "reconnect_delay_ms", with = "duration_ms")]
    pub reconnect_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Relay pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long `send` waits for the first relay acknowledgment
    #[serde(rename = "publish_timeout_ms", with = "duration_ms")]
    pub publish_timeout: Duration,
    /// Upper bound on waiting for every relay's EOSE before reporting one anyway
    #[serde(rename = "eose_timeout_ms", with = "duration_ms")]
    pub eose_timeout: Duration,
    /// Event ids remembered for relay provenance and per-subscription de-duplication
    pub seen_capacity: usize,
    /// Per-relay connection settings
    pub relay: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(3),
            eose_timeout: Duration::from_secs(10),
            seen_capacity: 10_000,
            relay: RelayConfig::default(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.publish_timeout, Duration::from_secs(3));
        assert_eq!(config.relay.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: PoolConfig = serde_json::from_str(
            r#"{"publish_timeout_ms": 1500, "relay": {"reconnect_delay_ms": 250}}"#,
        )
        .unwrap();

        assert_eq!(config.publish_timeout, Duration::from_millis(1500));
        assert_eq!(config.eose_timeout, PoolConfig::default().eose_timeout);
        assert_eq!(config.seen_capacity, 10_000);
        assert_eq!(config.relay.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.relay.connect_timeout, RelayConfig::default().connect_timeout);
    }
}
