//! Publish/subscribe transport capability.
//!
//! This module contains:
//! - `Transport` trait: subscribe/unsubscribe/publish/disconnect
//! - `MessageHandler` trait: callbacks invoked on the delivery task
//! - `SubscriptionTable`: filter registry shared by implementations
//! - Implementations: MQTT (rumqttc), in-process channel, mock

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::trace;

// Implementation modules
pub mod channel;
pub mod mock;
#[cfg(feature = "mqtt")]
pub mod mqtt;

// Re-exports
pub use channel::ChannelTransport;
pub use mock::{MockTransport, Operation};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

// ============================================================================
// Types
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe to '{topic}' failed: {detail}")]
    Subscribe { topic: String, detail: String },

    #[error("Unsubscribe from '{topic}' failed: {detail}")]
    Unsubscribe { topic: String, detail: String },

    #[error("Publish to '{topic}' failed: {detail}")]
    Publish { topic: String, detail: String },

    #[error("Transport is disconnected")]
    Disconnected,
}

/// Delivery quality level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Delivered one or more times.
    #[default]
    AtLeastOnce,
    /// Delivered exactly once.
    ExactlyOnce,
}

impl QoS {
    /// Numeric level as it appears on the wire.
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}, expected 0, 1 or 2")),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// A message as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Callback for messages arriving on a subscribed topic.
///
/// Invoked on the transport's delivery task, one message at a time, in the
/// order the transport received them. Implementations must not block.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

/// Interface to a connected publish/subscribe session.
///
/// Implementations:
/// - `MqttTransport`: MQTT over mutual TLS
/// - `ChannelTransport`: in-process broker
/// - `MockTransport`: scripted mock for testing
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register `handler` for messages matching `filter`.
    ///
    /// Once this returns, a message published afterwards to a matching topic
    /// is delivered to the handler.
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    /// Remove every handler registered under exactly `filter`.
    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Publish `payload` to `topic`.
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()>;

    /// Close the session, allowing up to `grace` for in-flight work.
    async fn disconnect(&self, grace: Duration) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Default MQTT over TLS port.
pub const DEFAULT_MQTT_PORT: u16 = 8883;

/// MQTT connection configuration.
///
/// The claim certificate and key authenticate the connection; they are only
/// used for provisioning and are replaced by the issued credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name (e.g. `xxxx-ats.iot.us-east-1.amazonaws.com`).
    pub endpoint: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier. Defaults to `device-<serial_number>`.
    pub client_id: Option<String>,
    /// Path to the PEM claim certificate.
    pub claim_certificate: String,
    /// Path to the PEM claim private key.
    pub claim_private_key: String,
    /// Path to the PEM root CA bundle.
    pub root_ca: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Maximum wait for the broker's CONNACK, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Grace period for in-flight work on disconnect, in milliseconds.
    pub disconnect_grace_ms: u64,
    /// Capacity of the client request queue.
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: DEFAULT_MQTT_PORT,
            client_id: None,
            claim_certificate: "device_cert.pem".to_string(),
            claim_private_key: "device_key.pem".to_string(),
            root_ca: "root_ca.pem".to_string(),
            keep_alive_secs: 30,
            connect_timeout_ms: 10_000,
            disconnect_grace_ms: 250,
            channel_capacity: 10,
        }
    }
}

impl MqttConfig {
    /// Client identifier, falling back to `device-<serial_number>`.
    pub fn client_id_for(&self, serial_number: &str) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("device-{serial_number}"))
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

// ============================================================================
// Topic matching
// ============================================================================

/// Check if a topic matches an MQTT topic filter.
///
/// Matching rules:
/// - `+` matches exactly one level
/// - `#` as the last level matches the parent and any number of sub-levels
/// - Wildcards in the first level never match topics starting with `$`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ============================================================================
// Subscription table
// ============================================================================

struct Subscription {
    filter: String,
    handler: Arc<dyn MessageHandler>,
}

/// Ordered registry of topic filters and their handlers.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, filter: &str, handler: Arc<dyn MessageHandler>) {
        self.entries.write().await.push(Subscription {
            filter: filter.to_string(),
            handler,
        });
    }

    /// Remove all handlers registered under `filter`. Returns how many were removed.
    pub async fn remove(&self, filter: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|s| s.filter != filter);
        before - entries.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Deliver `message` to every matching handler in registration order.
    ///
    /// Returns the number of handlers invoked.
    pub async fn dispatch(&self, message: &Message) -> usize {
        // Snapshot so handlers may touch the table without deadlocking.
        let matching: Vec<Arc<dyn MessageHandler>> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|s| topic_matches(&s.filter, &message.topic))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        trace!(
            topic = %message.topic,
            handlers = matching.len(),
            "Dispatching message"
        );

        for handler in &matching {
            handler.handle(message);
        }
        matching.len()
    }
}

#[cfg(test)]
mod tests;
