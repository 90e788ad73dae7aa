//! Subscriptions with concurrent dispatch.
//!
//! `on` subscribes to a `(topic, channel)` pair and starts `concurrency`
//! workers pulling deliveries from the subscription's single inbound queue.
//! Each delivery is decoded, handed to the user handler and, when the
//! envelope names a reply destination, the handler's value is published
//! there. Workers run in parallel, so processing order is not preserved.
//!
//! A listener runs until `ListenerHandle::stop` is called. Dropping the
//! handle leaves it running for the life of the process.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::dispatch::{self, ReplyEmitter};
use crate::bus::{
    BrokerSettings, BusError, Delivery, Result, Subscription, Transport, TransportOptions,
    DEFAULT_LOOKUP,
};
use crate::emitter::EmitterConfig;
use crate::envelope::Message;

/// Value returned by a handler: the reply payload, or an error that makes the
/// broker redeliver the message.
pub type HandlerResult = std::result::Result<serde_json::Value, BusError>;

/// Handler for messages received by a listener.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(message))
    }
}

/// Box a closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(f)
}

/// Convert a value into a handler reply.
pub fn reply<T: Serialize + ?Sized>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(BusError::Encoding)
}

/// Listener configuration.
#[derive(Clone)]
pub struct ListenerConfig {
    /// Topic to subscribe to.
    pub topic: String,
    /// Consumer group (channel) within the topic.
    pub channel: String,
    /// Discovery addresses; defaults to `DEFAULT_LOOKUP` when empty.
    pub lookup: Vec<String>,
    /// Message handler.
    pub handler: Option<Arc<dyn MessageHandler>>,
    /// Number of concurrent workers; 0 means 1.
    pub concurrency: usize,
    /// Tunables forwarded to the broker client.
    pub settings: BrokerSettings,
    /// Configuration of the emitter publishing replies.
    pub reply: EmitterConfig,
}

impl ListenerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            lookup: Vec::new(),
            handler: None,
            concurrency: 1,
            settings: BrokerSettings::default(),
            reply: EmitterConfig::default(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_settings(mut self, settings: BrokerSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .field("lookup", &self.lookup)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .field("concurrency", &self.concurrency)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Handle to a running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    topic: String,
    channel: String,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }

    /// Stop the workers and end the broker session.
    ///
    /// In-flight handler invocations finish first; undelivered messages stay
    /// with the broker.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(topic = %self.topic, channel = %self.channel, error = %e, "Listener worker ended abnormally");
            }
        }
        info!(topic = %self.topic, channel = %self.channel, "Listener stopped");
    }
}

/// Subscribe to `(config.topic, config.channel)` and start dispatching.
///
/// Fails before any I/O when the topic, channel or handler is missing.
pub async fn on(transport: Arc<dyn Transport>, config: ListenerConfig) -> Result<ListenerHandle> {
    if config.topic.is_empty() {
        return Err(BusError::TopicRequired);
    }
    if config.channel.is_empty() {
        return Err(BusError::ChannelRequired);
    }
    let handler = config.handler.clone().ok_or(BusError::HandlerRequired)?;

    let lookup = if config.lookup.is_empty() {
        vec![DEFAULT_LOOKUP.to_string()]
    } else {
        config.lookup.clone()
    };
    let concurrency = config.concurrency.max(1);

    debug!(topic = %config.topic, channel = %config.channel, state = "subscribing", "Listener subscribing");
    let subscription = transport
        .connect_consumer(&config.topic, &config.channel, &lookup, &config.settings)
        .await?;

    let options = Arc::new(TransportOptions::from(&config.settings));
    let replies = Arc::new(ReplyEmitter::new(transport, config.reply.clone()));
    let inbound = Arc::new(Mutex::new(subscription));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let workers = (0..concurrency)
        .map(|worker| {
            tokio::spawn(run_worker(
                worker,
                Arc::clone(&inbound),
                Arc::clone(&handler),
                Arc::clone(&replies),
                Arc::clone(&options),
                shutdown_rx.clone(),
            ))
        })
        .collect();

    info!(
        topic = %config.topic,
        channel = %config.channel,
        concurrency,
        state = "dispatching",
        "Listener started"
    );

    Ok(ListenerHandle {
        topic: config.topic,
        channel: config.channel,
        shutdown,
        workers,
    })
}

async fn next_delivery(inbound: &Mutex<Subscription>) -> Option<Delivery> {
    inbound.lock().await.next().await
}

async fn run_worker(
    worker: usize,
    inbound: Arc<Mutex<Subscription>>,
    handler: Arc<dyn MessageHandler>,
    replies: Arc<ReplyEmitter>,
    options: Arc<TransportOptions>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Set once the handle is dropped: no stop signal can arrive any more.
    let mut detached = false;

    loop {
        let delivery = tokio::select! {
            changed = shutdown.changed(), if !detached => {
                if changed.is_err() {
                    detached = true;
                } else if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            delivery = next_delivery(&inbound) => delivery,
        };

        let Some(delivery) = delivery else {
            debug!(worker, "Subscription closed by broker");
            break;
        };

        let result = dispatch::process_delivery(&delivery, handler.as_ref(), &replies).await;
        if result.should_finish() {
            delivery.finish();
        } else {
            let delay = options.requeue_delay(delivery.attempts);
            debug!(worker, message_id = %delivery.id, attempts = delivery.attempts, ?result, ?delay, "Requeueing message");
            delivery.requeue(delay);
        }
    }
}
