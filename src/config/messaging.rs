//! Messaging configuration types.

use serde::Deserialize;

/// Messaging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// NATS JetStream configuration.
    pub nats: NatsConfig,
}

/// NATS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Client name reported to the server.
    pub client_name: String,
    /// Reconnect attempts after a lost connection. `None` retries forever.
    pub max_reconnects: Option<usize>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: "eventrelay".to_string(),
            max_reconnects: Some(60),
        }
    }
}
