//! Outbound publishing and request/reply.
//!
//! An `Emitter` owns one publisher connection and one circuit breaker. Every
//! publish goes through the breaker; once it opens, calls fail fast with
//! `BusError::CircuitOpen` until the cool-down has passed.
//!
//! `request` turns one-way publishing into a correlated call: it provisions a
//! fresh `.ephemeral` reply topic, subscribes the caller's handler to it and
//! publishes the payload with `ReplyTo` pointing there. The reply
//! subscription ends after the first handled reply or after
//! `reply_timeout`, whichever comes first.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use crate::breaker::{Breaker, BreakerConfig, BreakerError};
use crate::bus::provision::{self, HttpProvisioner};
use crate::bus::{
    BrokerSettings, BusError, Provisioner, Publisher, Result, Transport, DEFAULT_ADDRESS,
    DEFAULT_LOOKUP, DEFAULT_REPLY_TIMEOUT,
};
use crate::envelope::{self, Message};
use crate::listener::{self, handler_fn, HandlerResult, ListenerConfig, ListenerHandle, MessageHandler};

/// Capacity of the asynchronous failure channel.
const ASYNC_ERROR_CAPACITY: usize = 64;

/// Emitter configuration.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Broker data address; `DEFAULT_ADDRESS` when empty.
    pub address: String,
    /// Discovery addresses used by reply subscriptions.
    pub lookup: Vec<String>,
    /// Admin API address, overriding the one derived from `address`.
    pub admin_address: Option<String>,
    /// Tunables forwarded to the broker client.
    pub settings: BrokerSettings,
    /// Breaker guarding every publish.
    pub breaker: BreakerConfig,
    /// Lifetime of a reply subscription created by `request`.
    pub reply_timeout: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            lookup: vec![DEFAULT_LOOKUP.to_string()],
            admin_address: None,
            settings: BrokerSettings::default(),
            breaker: BreakerConfig::named("emitter"),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

/// An `emit_async` publish the broker did not acknowledge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncPublishError {
    pub destination: String,
    pub error: String,
}

struct EmitterInner {
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publisher>,
    provisioner: Arc<dyn Provisioner>,
    breaker: Breaker,
    config: EmitterConfig,
    async_errors: broadcast::Sender<AsyncPublishError>,
}

/// Publishes envelopes to named destinations.
///
/// Cheap to clone; clones share the connection and the breaker.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<EmitterInner>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("address", &self.inner.config.address)
            .field("breaker", &self.inner.breaker)
            .finish()
    }
}

impl Emitter {
    /// Connect a publisher for `config.address`.
    pub async fn new(transport: Arc<dyn Transport>, mut config: EmitterConfig) -> Result<Self> {
        if config.address.is_empty() {
            config.address = DEFAULT_ADDRESS.to_string();
        }
        if config.lookup.is_empty() {
            config.lookup = vec![DEFAULT_LOOKUP.to_string()];
        }
        if config.reply_timeout.is_zero() {
            config.reply_timeout = DEFAULT_REPLY_TIMEOUT;
        }

        let provisioner: Arc<dyn Provisioner> = match &config.admin_address {
            Some(admin) => Arc::new(HttpProvisioner::new(admin)),
            None => transport.provisioner(&config.address)?,
        };
        let publisher = transport
            .connect_publisher(&config.address, &config.settings)
            .await?;
        let breaker = Breaker::new(config.breaker.clone());
        let (async_errors, _) = broadcast::channel(ASYNC_ERROR_CAPACITY);

        info!(address = %config.address, breaker = %breaker.name(), "Emitter connected");

        Ok(Self {
            inner: Arc::new(EmitterInner {
                transport,
                publisher,
                provisioner,
                breaker,
                config,
                async_errors,
            }),
        })
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.inner.config
    }

    /// Breaker guarding this emitter's publishes.
    pub fn breaker(&self) -> &Breaker {
        &self.inner.breaker
    }

    /// Stream of `emit_async` failures.
    ///
    /// Only failures that happen after subscribing are seen.
    pub fn async_errors(&self) -> broadcast::Receiver<AsyncPublishError> {
        self.inner.async_errors.subscribe()
    }

    /// Publish `payload` to `destination` and wait for the broker.
    pub async fn emit<P: Serialize + ?Sized>(&self, destination: &str, payload: &P) -> Result<()> {
        if destination.is_empty() {
            return Err(BusError::DestinationRequired);
        }
        let body = Bytes::from(envelope::encode(payload, None)?);
        self.publish(destination, body).await
    }

    /// Publish `payload` without waiting for the broker.
    ///
    /// Returns once the send is accepted locally. A failed acknowledgment is
    /// recorded by the breaker, logged and sent on `async_errors`.
    pub async fn emit_async<P: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &P,
    ) -> Result<()> {
        if destination.is_empty() {
            return Err(BusError::DestinationRequired);
        }
        let body = Bytes::from(envelope::encode(payload, None)?);

        let permit = self.inner.breaker.allow().ok_or_else(|| self.circuit_open())?;
        let pending = match self.inner.publisher.publish_async(destination, body).await {
            Ok(pending) => pending,
            Err(e) => {
                self.inner.breaker.record(permit, false);
                return Err(e);
            }
        };

        let inner = Arc::clone(&self.inner);
        let destination = destination.to_string();
        tokio::spawn(async move {
            match pending.await {
                Ok(()) => inner.breaker.record(permit, true),
                Err(e) => {
                    inner.breaker.record(permit, false);
                    error!(destination = %destination, error = %e, "Asynchronous publish failed");
                    // No receivers is fine: the failure has been logged.
                    let _ = inner.async_errors.send(AsyncPublishError {
                        destination,
                        error: e.to_string(),
                    });
                }
            }
        });

        Ok(())
    }

    /// Publish `payload` to `destination` and route the reply to `handler`.
    ///
    /// Returns once the request itself is published; the reply arrives later
    /// through `handler`, at most once.
    pub async fn request<P: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &P,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<()> {
        self.request_within(destination, payload, handler, self.inner.config.reply_timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for its reply, decoded as `T`.
    pub async fn call<T, P>(&self, destination: &str, payload: &P, timeout: Duration) -> Result<T>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let (tx, rx) = oneshot::channel::<Message>();
        let slot = Mutex::new(Some(tx));
        let handler = handler_fn(move |message: Message| {
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(message);
            }
            async { Ok::<_, BusError>(serde_json::Value::Null) }
        });

        self.request_within(destination, payload, Some(handler), timeout)
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => message.decode_payload(),
            _ => Err(BusError::ReplyTimeout {
                destination: destination.to_string(),
                timeout,
            }),
        }
    }

    async fn request_within<P: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &P,
        handler: Option<Arc<dyn MessageHandler>>,
        lifetime: Duration,
    ) -> Result<()> {
        if destination.is_empty() {
            return Err(BusError::DestinationRequired);
        }
        let handler = handler.ok_or(BusError::HandlerRequired)?;

        let reply_to = provision::reply_destination();
        let body = Bytes::from(envelope::encode(payload, Some(&reply_to))?);

        self.inner.provisioner.create_topic(&reply_to).await?;

        let (answered, answer) = oneshot::channel();
        let reply_handler: Arc<dyn MessageHandler> = Arc::new(ReplyOnce {
            handler,
            answered: Arc::new(Mutex::new(Some(answered))),
        });
        let config = ListenerConfig {
            lookup: self.inner.config.lookup.clone(),
            settings: self.inner.config.settings.clone(),
            reply: self.inner.config.clone(),
            ..ListenerConfig::new(reply_to.clone(), reply_to.clone())
        }
        .with_handler(reply_handler);

        let subscription = match listener::on(Arc::clone(&self.inner.transport), config).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.teardown(&reply_to).await;
                return Err(e);
            }
        };

        if let Err(e) = self.publish(destination, body).await {
            subscription.stop().await;
            self.teardown(&reply_to).await;
            return Err(e);
        }

        debug!(destination = %destination, reply_to = %reply_to, "Request published");
        tokio::spawn(expire_reply(
            subscription,
            answer,
            lifetime,
            Arc::clone(&self.inner.provisioner),
        ));
        Ok(())
    }

    async fn publish(&self, destination: &str, body: Bytes) -> Result<()> {
        self.inner
            .breaker
            .execute(|| self.inner.publisher.publish(destination, body))
            .await
            .map_err(|e| match e {
                BreakerError::Open => self.circuit_open(),
                BreakerError::Inner(e) => e,
            })
    }

    async fn teardown(&self, reply_to: &str) {
        teardown(self.inner.provisioner.as_ref(), reply_to).await;
    }

    fn circuit_open(&self) -> BusError {
        BusError::CircuitOpen {
            name: self.inner.breaker.name().to_string(),
        }
    }
}

async fn teardown(provisioner: &dyn Provisioner, reply_to: &str) {
    if let Err(e) = provisioner.delete_topic(reply_to).await {
        debug!(reply_to = %reply_to, error = %e, "Reply topic teardown failed");
    }
}

/// End a reply subscription after its first reply or after `lifetime`.
async fn expire_reply(
    subscription: ListenerHandle,
    answer: oneshot::Receiver<()>,
    lifetime: Duration,
    provisioner: Arc<dyn Provisioner>,
) {
    tokio::select! {
        Ok(()) = answer => {
            debug!(reply_to = %subscription.topic(), "Reply handled");
        }
        _ = tokio::time::sleep(lifetime) => {
            debug!(reply_to = %subscription.topic(), ?lifetime, "Reply subscription expired");
        }
    }

    let reply_to = subscription.topic().to_string();
    subscription.stop().await;
    teardown(provisioner.as_ref(), &reply_to).await;
}

/// Passes the first successfully handled reply to the caller's handler and
/// ignores any later duplicate.
struct ReplyOnce {
    handler: Arc<dyn MessageHandler>,
    answered: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl MessageHandler for ReplyOnce {
    fn handle(&self, message: Message) -> futures::future::BoxFuture<'static, HandlerResult> {
        let answered = Arc::clone(&self.answered);
        if answered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            debug!(message_id = %message.id(), "Dropping duplicate reply");
            return Box::pin(async { Ok(serde_json::Value::Null) });
        }

        let handling = self.handler.handle(message);
        Box::pin(async move {
            let result = handling.await;
            if result.is_ok() {
                if let Some(tx) = answered.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(());
                }
            }
            result
        })
    }
}

#[cfg(test)]
mod tests;
