//! In-process broker for standalone mode.
//!
//! Topics fan out to consumer groups: every group receives its own copy of a
//! message, and within a group each message goes to one subscriber, picked
//! round-robin. Messages published before any group exists are held on the
//! topic and handed to the first group that subscribes; messages for a group
//! without live subscribers wait on that group.
//!
//! Deliveries are tracked until acknowledged. A requeue redelivers after the
//! requested delay, up to the group's attempt limit.
//!
//! Ephemeral topics are never held for later: a publish to one without live
//! subscribers is dropped, and the topic is removed once its last subscriber
//! goes away.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::provision::is_ephemeral;
use super::{
    Ack, BrokerSettings, BusError, Delivery, PendingAck, Provisioner, Publisher, Result,
    Subscription, Transport, TransportOptions,
};

/// A message waiting for, or out on, delivery.
#[derive(Debug, Clone)]
struct Pending {
    id: String,
    body: Bytes,
    /// Deliveries made so far.
    attempts: u16,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct Group {
    subscribers: Vec<Subscriber>,
    next: usize,
    backlog: VecDeque<Pending>,
    /// 0 = unlimited.
    max_attempts: u16,
}

#[derive(Debug, Default)]
struct Topic {
    groups: HashMap<String, Group>,
    backlog: VecDeque<Pending>,
    /// Dropped with the topic, releasing its reaper tasks.
    reapers: Vec<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct ChannelBroker {
    topics: Mutex<HashMap<String, Topic>>,
    next_subscriber: AtomicU64,
}

impl ChannelBroker {
    /// Hand `pending` to the next live subscriber of `group`, or park it on
    /// the group's backlog.
    fn offer(
        self: &Arc<Self>,
        topic: &str,
        group_name: &str,
        group: &mut Group,
        mut pending: Pending,
    ) {
        group.subscribers.retain(|s| !s.sender.is_closed());

        while !group.subscribers.is_empty() {
            let index = group.next % group.subscribers.len();
            group.next = group.next.wrapping_add(1);

            let attempts = pending.attempts.saturating_add(1);
            let (delivery, ack) = Delivery::new(pending.id.clone(), pending.body.clone(), attempts);
            if group.subscribers[index].sender.send(delivery).is_err() {
                let gone = group.subscribers.remove(index);
                debug!(topic = %topic, group = %group_name, subscriber = gone.id, "Subscriber gone");
                continue;
            }

            pending.attempts = attempts;
            self.track(topic.to_string(), group_name.to_string(), pending, ack);
            return;
        }

        group.backlog.push_back(pending);
    }

    /// Wait for the outcome of one delivery and redeliver on requeue.
    fn track(
        self: &Arc<Self>,
        topic: String,
        group_name: String,
        pending: Pending,
        ack: oneshot::Receiver<Ack>,
    ) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let delay = match ack.await {
                Ok(Ack::Finish) => return,
                Ok(Ack::Requeue(delay)) => delay,
                Err(_) => std::time::Duration::ZERO,
            };

            if delay > std::time::Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            let mut topics = broker.topics.lock().await;
            let Some(group) = topics
                .get_mut(&topic)
                .and_then(|t| t.groups.get_mut(&group_name))
            else {
                debug!(topic = %topic, group = %group_name, message_id = %pending.id, "Dropping requeue for deleted topic");
                return;
            };

            if group.max_attempts != 0 && pending.attempts >= group.max_attempts {
                warn!(
                    topic = %topic,
                    group = %group_name,
                    message_id = %pending.id,
                    attempts = pending.attempts,
                    "Giving up on message after max attempts"
                );
                return;
            }

            broker.offer(&topic, &group_name, group, pending);
        });
    }

    /// Remove ephemeral `topic` once the subscriber behind `sender` is gone
    /// and no other subscriber is left.
    ///
    /// The task ends early when the returned guard is dropped, so removing
    /// the topic still closes the session.
    fn reap_when_closed(
        self: &Arc<Self>,
        topic: String,
        sender: mpsc::UnboundedSender<Delivery>,
    ) -> oneshot::Sender<()> {
        let (guard, removed) = oneshot::channel();
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = sender.closed() => {}
                _ = removed => return,
            }
            drop(sender);

            let mut topics = broker.topics.lock().await;
            if topics.get_mut(&topic).is_some_and(Topic::is_idle) {
                topics.remove(&topic);
                debug!(topic = %topic, "Idle ephemeral topic removed");
            }
        });
        guard
    }
}

impl Topic {
    /// Prune closed subscribers; true when no group has a live one left.
    fn is_idle(&mut self) -> bool {
        for group in self.groups.values_mut() {
            group.subscribers.retain(|s| !s.sender.is_closed());
        }
        self.groups.values().all(|g| g.subscribers.is_empty())
    }
}

/// In-process broker transport.
///
/// Clones share the same broker, so a publisher and its consumers must be
/// created from the same instance (or its clones).
#[derive(Debug, Clone, Default)]
pub struct ChannelTransport {
    broker: Arc<ChannelBroker>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn topic_exists(&self, topic: &str) -> bool {
        self.broker.topics.lock().await.contains_key(topic)
    }

    /// Messages on `topic` still waiting for a subscriber.
    pub async fn pending(&self, topic: &str) -> usize {
        let topics = self.broker.topics.lock().await;
        topics.get(topic).map_or(0, |t| {
            t.backlog.len() + t.groups.values().map(|g| g.backlog.len()).sum::<usize>()
        })
    }

    /// Live subscribers of `(topic, group)`.
    pub async fn subscriber_count(&self, topic: &str, group: &str) -> usize {
        let topics = self.broker.topics.lock().await;
        topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.subscribers.iter().filter(|s| !s.sender.is_closed()).count())
    }

    fn validate(topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(BusError::Transport("topic name must not be empty".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for ChannelTransport {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        Self::validate(topic)?;

        let pending = Pending {
            id: uuid::Uuid::new_v4().simple().to_string(),
            body,
            attempts: 0,
        };

        let mut topics = self.broker.topics.lock().await;

        if is_ephemeral(topic) && topics.get_mut(topic).map_or(true, Topic::is_idle) {
            topics.remove(topic);
            debug!(topic = %topic, message_id = %pending.id, "No subscribers on ephemeral topic, message dropped");
            return Ok(());
        }

        let entry = topics.entry(topic.to_string()).or_default();

        if entry.groups.is_empty() {
            debug!(topic = %topic, message_id = %pending.id, "No consumer groups yet, holding message");
            entry.backlog.push_back(pending);
            return Ok(());
        }

        for (group_name, group) in entry.groups.iter_mut() {
            self.broker.offer(topic, group_name, group, pending.clone());
        }
        debug!(topic = %topic, message_id = %pending.id, groups = entry.groups.len(), "Message routed");
        Ok(())
    }

    async fn publish_async(&self, topic: &str, body: Bytes) -> Result<PendingAck> {
        Self::validate(topic)?;

        let (tx, rx) = oneshot::channel();
        let transport = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let _ = tx.send(transport.publish(&topic, body).await);
        });

        Ok(Box::pin(async move {
            rx.await.map_err(|_| {
                BusError::Transport("publish ended without acknowledgment".to_string())
            })?
        }))
    }
}

#[async_trait]
impl Provisioner for ChannelTransport {
    async fn create_topic(&self, topic: &str) -> Result<()> {
        Self::validate(topic)?;
        self.broker
            .topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        Self::validate(topic)?;
        if self.broker.topics.lock().await.remove(topic).is_some() {
            debug!(topic = %topic, "Topic deleted");
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect_publisher(
        &self,
        address: &str,
        _settings: &BrokerSettings,
    ) -> Result<Arc<dyn Publisher>> {
        debug!(address = %address, "Channel publisher connected");
        Ok(Arc::new(self.clone()))
    }

    async fn connect_consumer(
        &self,
        topic: &str,
        group: &str,
        _lookup: &[String],
        settings: &BrokerSettings,
    ) -> Result<Subscription> {
        Self::validate(topic)?;
        if group.is_empty() {
            return Err(BusError::Transport("group name must not be empty".to_string()));
        }

        let options = TransportOptions::from(settings);
        let (sender, inbound) = mpsc::unbounded_channel();
        let id = self.broker.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.broker.topics.lock().await;
        let entry = topics.entry(topic.to_string()).or_default();
        let first_group = entry.groups.is_empty();

        if is_ephemeral(topic) {
            let guard = self.broker.reap_when_closed(topic.to_string(), sender.clone());
            entry.reapers.push(guard);
        }

        let consumer_group = entry.groups.entry(group.to_string()).or_default();
        consumer_group.max_attempts = options.max_attempts;
        consumer_group.subscribers.push(Subscriber { id, sender });
        if first_group {
            consumer_group.backlog.extend(entry.backlog.drain(..));
        }

        let backlog = std::mem::take(&mut consumer_group.backlog);
        for pending in backlog {
            self.broker.offer(topic, group, consumer_group, pending);
        }

        debug!(topic = %topic, group = %group, subscriber = id, "Channel consumer connected");
        Ok(Subscription::new(inbound))
    }

    fn provisioner(&self, _address: &str) -> Result<Arc<dyn Provisioner>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests;
