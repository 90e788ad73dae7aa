//! Broker plumbing.
//!
//! This module contains:
//! - `Transport` trait: factory for publisher connections, consumer sessions
//!   and the administrative channel of a broker
//! - `Publisher` / `Provisioner` traits: outbound publish and topic management
//! - `Delivery`: one inbound broker message plus its acknowledgment
//! - Messaging configuration and the transport factory
//! - Implementations: Channel (in-process), NATS, NSQ, Mock

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

// Implementation modules
#[cfg(feature = "channel")]
pub mod channel;
pub mod dispatch;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "nsq")]
pub mod nsq;
pub mod provision;
pub mod settings;

// Re-exports
#[cfg(feature = "channel")]
pub use channel::ChannelTransport;
pub use mock::MockTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;
#[cfg(feature = "nsq")]
pub use nsq::NsqTransport;
pub use provision::{HttpProvisioner, NoopProvisioner};
pub use settings::{BreakerSettings, BrokerSettings, TransportOptions};

use crate::emitter::EmitterConfig;
use crate::listener::ListenerConfig;

/// Default broker data address used when none is configured.
pub const DEFAULT_ADDRESS: &str = "localhost:4150";
/// Default discovery address used by listeners when none is configured.
pub const DEFAULT_LOOKUP: &str = "localhost:4161";
/// Default lifetime of a reply subscription created by `request`.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Publishing requires a non-empty destination")]
    DestinationRequired,

    #[error("A message handler is required")]
    HandlerRequired,

    #[error("Creating a new consumer requires a non-empty topic")]
    TopicRequired,

    #[error("Creating a new consumer requires a non-empty channel")]
    ChannelRequired,

    #[error("Encoding failed: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("Decoding failed: {0}")]
    Decoding(#[source] serde_json::Error),

    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("No reply from '{destination}' within {timeout:?}")]
    ReplyTimeout {
        destination: String,
        timeout: Duration,
    },
}

impl BusError {
    /// Whether the caller may reasonably retry the same operation later.
    ///
    /// Validation and codec failures will fail again with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::Connection(_)
                | Self::Transport(_)
                | Self::ReplyTimeout { .. }
        )
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Outcome reported back to the broker for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Processing finished; the broker may forget the message.
    Finish,
    /// Processing failed; redeliver after the given delay.
    Requeue(Duration),
}

/// One inbound broker message.
///
/// Exactly one `Ack` is reported per delivery. A delivery dropped without an
/// explicit answer is requeued immediately.
#[derive(Debug)]
pub struct Delivery {
    /// Broker-assigned message id.
    pub id: String,
    /// Raw message body (an encoded envelope).
    pub body: Bytes,
    /// Number of times this message has been delivered, including this one.
    pub attempts: u16,
    ack: Option<oneshot::Sender<Ack>>,
}

impl Delivery {
    /// Create a delivery and the receiver on which its outcome is reported.
    pub fn new(
        id: impl Into<String>,
        body: Bytes,
        attempts: u16,
    ) -> (Self, oneshot::Receiver<Ack>) {
        let (tx, rx) = oneshot::channel();
        let delivery = Self {
            id: id.into(),
            body,
            attempts,
            ack: Some(tx),
        };
        (delivery, rx)
    }

    /// Acknowledge successful processing.
    pub fn finish(mut self) {
        self.respond(Ack::Finish);
    }

    /// Ask the broker to redeliver after `delay`.
    pub fn requeue(mut self, delay: Duration) {
        self.respond(Ack::Requeue(delay));
    }

    fn respond(&mut self, ack: Ack) {
        if let Some(tx) = self.ack.take() {
            // The broker side may already be gone; nothing left to tell.
            let _ = tx.send(ack);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.respond(Ack::Requeue(Duration::ZERO));
    }
}

/// Inbound queue of one consumer session.
///
/// Dropping the subscription ends the session.
#[derive(Debug)]
pub struct Subscription {
    inbound: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(inbound: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { inbound }
    }

    /// Wait for the next delivery. `None` once the broker closed the session.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.inbound.recv().await
    }
}

/// Acknowledgment of an asynchronous publish, resolved by the broker.
pub type PendingAck = BoxFuture<'static, Result<()>>;

// ============================================================================
// Traits
// ============================================================================

/// Outbound side of a broker connection.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish and wait for the broker to acknowledge the message.
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()>;

    /// Publish without waiting for the broker.
    ///
    /// Returns once the send has been accepted locally; the returned future
    /// resolves with the broker's acknowledgment.
    async fn publish_async(&self, topic: &str, body: Bytes) -> Result<PendingAck>;
}

/// Administrative topic management.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a topic ahead of its first publish or subscribe.
    async fn create_topic(&self, topic: &str) -> Result<()>;

    /// Remove a topic and anything still queued on it.
    async fn delete_topic(&self, topic: &str) -> Result<()>;
}

/// A broker client library.
///
/// Implementations:
/// - `ChannelTransport`: in-process broker
/// - `NatsTransport`: NATS core with queue groups
/// - `NsqTransport`: nsqd publishers, nsqlookupd-discovered consumers
/// - `MockTransport`: recording transport for tests
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a publisher connection to the broker at `address`.
    async fn connect_publisher(
        &self,
        address: &str,
        settings: &BrokerSettings,
    ) -> Result<Arc<dyn Publisher>>;

    /// Open a consumer session for `(topic, group)`.
    async fn connect_consumer(
        &self,
        topic: &str,
        group: &str,
        lookup: &[String],
        settings: &BrokerSettings,
    ) -> Result<Subscription>;

    /// Administrative channel for the broker at `address`.
    ///
    /// Defaults to the HTTP admin API listening next to the data port.
    fn provisioner(&self, address: &str) -> Result<Arc<dyn Provisioner>> {
        Ok(Arc::new(HttpProvisioner::from_data_address(address)?))
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Transport type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// In-process broker.
    #[default]
    Channel,
    /// NATS core.
    Nats,
    /// nsqd with nsqlookupd discovery.
    Nsq,
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Transport type discriminator.
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    /// Broker data address for publishers.
    pub address: String,
    /// Discovery addresses for consumers.
    pub lookup: Vec<String>,
    /// Admin API address, overriding the one derived from `address`.
    pub admin_address: Option<String>,
    /// Tunables forwarded to the broker client.
    pub settings: BrokerSettings,
    /// Circuit breaker guarding outbound publishes.
    pub breaker: BreakerSettings,
    /// Lifetime of reply subscriptions, in milliseconds.
    pub reply_timeout_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Channel,
            address: DEFAULT_ADDRESS.to_string(),
            lookup: vec![DEFAULT_LOOKUP.to_string()],
            admin_address: None,
            settings: BrokerSettings::default(),
            breaker: BreakerSettings::default(),
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl MessagingConfig {
    /// Emitter configuration derived from this section.
    pub fn emitter_config(&self) -> EmitterConfig {
        let reply_timeout = match self.reply_timeout_ms {
            0 => DEFAULT_REPLY_TIMEOUT,
            ms => Duration::from_millis(ms),
        };

        EmitterConfig {
            address: self.address.clone(),
            lookup: self.lookup.clone(),
            admin_address: self.admin_address.clone(),
            settings: self.settings.clone(),
            breaker: self.breaker.to_config("emitter"),
            reply_timeout,
        }
    }

    /// Listener configuration for `(topic, channel)`; the handler is left unset.
    pub fn listener_config(
        &self,
        topic: impl Into<String>,
        channel: impl Into<String>,
    ) -> ListenerConfig {
        ListenerConfig {
            lookup: self.lookup.clone(),
            settings: self.settings.clone(),
            reply: self.emitter_config(),
            ..ListenerConfig::new(topic, channel)
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a transport based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Channel: `--features channel` (included in default)
/// - NATS: `--features nats`
/// - NSQ: `--features nsq`
pub fn init_transport(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn Transport>, Box<dyn std::error::Error + Send + Sync>> {
    match config.transport_type {
        TransportType::Channel => {
            #[cfg(feature = "channel")]
            {
                info!(transport = "channel", "Transport initialized");
                Ok(Arc::new(ChannelTransport::new()))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err("Channel transport requires the 'channel' feature. Rebuild with --features channel".into())
            }
        }
        TransportType::Nats => {
            #[cfg(feature = "nats")]
            {
                info!(transport = "nats", address = %config.address, "Transport initialized");
                Ok(Arc::new(NatsTransport::new()))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err("NATS support requires the 'nats' feature. Rebuild with --features nats".into())
            }
        }
        TransportType::Nsq => {
            #[cfg(feature = "nsq")]
            {
                info!(transport = "nsq", address = %config.address, lookup = ?config.lookup, "Transport initialized");
                Ok(Arc::new(NsqTransport::new()))
            }

            #[cfg(not(feature = "nsq"))]
            {
                Err("NSQ support requires the 'nsq' feature. Rebuild with --features nsq".into())
            }
        }
    }
}

#[cfg(test)]
mod tests;
