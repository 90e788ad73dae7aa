//! Mock transport for testing.
//!
//! Records every publish and provisioning call, lets tests inject deliveries
//! into consumer sessions, and can be told to fail each operation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::{
    Ack, BrokerSettings, BusError, Delivery, PendingAck, Provisioner, Publisher, Result,
    Subscription, Transport,
};

#[derive(Default)]
struct MockState {
    published: RwLock<Vec<(String, Bytes)>>,
    publish_calls: RwLock<usize>,
    publisher_connections: RwLock<usize>,
    consumers: RwLock<Vec<MockConsumer>>,
    created: RwLock<Vec<String>>,
    deleted: RwLock<Vec<String>>,
    fail_on_publish: RwLock<bool>,
    fail_on_publish_async: RwLock<bool>,
    fail_on_connect: RwLock<bool>,
    fail_on_provision: RwLock<bool>,
}

struct MockConsumer {
    topic: String,
    group: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// Mock transport for testing.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.state.fail_on_publish.write().await = fail;
    }

    /// Make asynchronous publishes accept locally but fail their acknowledgment.
    pub async fn set_fail_on_publish_async(&self, fail: bool) {
        *self.state.fail_on_publish_async.write().await = fail;
    }

    pub async fn set_fail_on_connect(&self, fail: bool) {
        *self.state.fail_on_connect.write().await = fail;
    }

    pub async fn set_fail_on_provision(&self, fail: bool) {
        *self.state.fail_on_provision.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.state.published.read().await.len()
    }

    /// Publish attempts, including failed ones.
    pub async fn publish_calls(&self) -> usize {
        *self.state.publish_calls.read().await
    }

    pub async fn take_published(&self) -> Vec<(String, Bytes)> {
        std::mem::take(&mut *self.state.published.write().await)
    }

    pub async fn publisher_connections(&self) -> usize {
        *self.state.publisher_connections.read().await
    }

    /// Consumer sessions still open, as `(topic, group)` pairs.
    pub async fn subscriptions(&self) -> Vec<(String, String)> {
        self.state
            .consumers
            .read()
            .await
            .iter()
            .filter(|c| !c.sender.is_closed())
            .map(|c| (c.topic.clone(), c.group.clone()))
            .collect()
    }

    pub async fn created_topics(&self) -> Vec<String> {
        self.state.created.read().await.clone()
    }

    pub async fn deleted_topics(&self) -> Vec<String> {
        self.state.deleted.read().await.clone()
    }

    /// Hand `body` to the first open session on `topic`.
    ///
    /// Returns the receiver of the delivery's acknowledgment, or `None` when
    /// nothing is subscribed.
    pub async fn deliver(&self, topic: &str, body: impl Into<Bytes>) -> Option<oneshot::Receiver<Ack>> {
        self.deliver_attempt(topic, body, 1).await
    }

    /// Like `deliver`, with an explicit attempt count.
    pub async fn deliver_attempt(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        attempts: u16,
    ) -> Option<oneshot::Receiver<Ack>> {
        let consumers = self.state.consumers.read().await;
        let consumer = consumers
            .iter()
            .find(|c| c.topic == topic && !c.sender.is_closed())?;

        let (delivery, ack) = Delivery::new(uuid::Uuid::new_v4().simple().to_string(), body.into(), attempts);
        consumer.sender.send(delivery).ok()?;
        Some(ack)
    }

    async fn record_publish(&self, topic: &str, body: Bytes) -> Result<()> {
        *self.state.publish_calls.write().await += 1;
        if *self.state.fail_on_publish.read().await {
            return Err(BusError::Transport("Mock publish failure".to_string()));
        }
        self.state
            .published
            .write()
            .await
            .push((topic.to_string(), body));
        Ok(())
    }
}

#[async_trait]
impl Publisher for MockTransport {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        self.record_publish(topic, body).await
    }

    async fn publish_async(&self, topic: &str, body: Bytes) -> Result<PendingAck> {
        if *self.state.fail_on_publish_async.read().await {
            *self.state.publish_calls.write().await += 1;
            return Ok(Box::pin(async {
                Err(BusError::Transport("Mock async publish failure".to_string()))
            }));
        }
        let result = self.record_publish(topic, body).await;
        Ok(Box::pin(async move { result }))
    }
}

#[async_trait]
impl Provisioner for MockTransport {
    async fn create_topic(&self, topic: &str) -> Result<()> {
        if *self.state.fail_on_provision.read().await {
            return Err(BusError::Connection("Mock provisioning failure".to_string()));
        }
        self.state.created.write().await.push(topic.to_string());
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.state.deleted.write().await.push(topic.to_string());
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect_publisher(
        &self,
        _address: &str,
        _settings: &BrokerSettings,
    ) -> Result<Arc<dyn Publisher>> {
        if *self.state.fail_on_connect.read().await {
            return Err(BusError::Connection("Mock connection failure".to_string()));
        }
        *self.state.publisher_connections.write().await += 1;
        Ok(Arc::new(self.clone()))
    }

    async fn connect_consumer(
        &self,
        topic: &str,
        group: &str,
        _lookup: &[String],
        _settings: &BrokerSettings,
    ) -> Result<Subscription> {
        if *self.state.fail_on_connect.read().await {
            return Err(BusError::Connection("Mock connection failure".to_string()));
        }
        let (sender, inbound) = mpsc::unbounded_channel();
        self.state.consumers.write().await.push(MockConsumer {
            topic: topic.to_string(),
            group: group.to_string(),
            sender,
        });
        Ok(Subscription::new(inbound))
    }

    fn provisioner(&self, _address: &str) -> Result<Arc<dyn Provisioner>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_publish_records_message() {
        let transport = MockTransport::new();
        transport.publish("orders", Bytes::from_static(b"{}")).await.unwrap();

        assert_eq!(transport.published_count().await, 1);
        assert_eq!(transport.take_published().await[0].0, "orders");
        assert_eq!(transport.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_fail_on_publish() {
        let transport = MockTransport::new();
        transport.set_fail_on_publish(true).await;

        let result = transport.publish("orders", Bytes::new()).await;
        assert!(matches!(result, Err(BusError::Transport(_))));
        assert_eq!(transport.publish_calls().await, 1);
    }

    #[tokio::test]
    async fn test_mock_async_failure_surfaces_in_ack() {
        let transport = MockTransport::new();
        transport.set_fail_on_publish_async(true).await;

        let pending = transport.publish_async("orders", Bytes::new()).await.unwrap();
        assert!(pending.await.is_err());
    }

    #[tokio::test]
    async fn test_mock_deliver_reaches_consumer() {
        let transport = MockTransport::new();
        let mut subscription = transport
            .connect_consumer("orders", "g1", &[], &BrokerSettings::default())
            .await
            .unwrap();

        let ack = transport.deliver("orders", "body").await.unwrap();
        let delivery = subscription.next().await.unwrap();
        assert_eq!(delivery.body, Bytes::from_static(b"body"));
        delivery.finish();

        assert_eq!(ack.await.unwrap(), Ack::Finish);
    }

    #[tokio::test]
    async fn test_mock_deliver_without_consumer() {
        let transport = MockTransport::new();
        assert!(transport.deliver("orders", "body").await.is_none());
    }
}
