//! NATS core transport.
//!
//! Topics map to subjects and consumer groups to queue groups, so each group
//! receives one copy of a message and its members share the load. Subjects
//! need no provisioning.
//!
//! NATS core has no redelivery: a requeued delivery is logged and dropped.
//! Nor does it keep messages for absent subscribers, so a consumer session
//! is only handed out once the server confirmed its subscription.
//!
//! # Configuration
//!
//! ```yaml
//! messaging:
//!   type: nats
//!   address: "localhost:4222"
//!   lookup: ["localhost:4222"]
//!   settings:
//!     dial_timeout_ms: 2000
//!     auth_secret: "s3cr3t"
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    Ack, BrokerSettings, BusError, Delivery, NoopProvisioner, PendingAck, Provisioner, Publisher,
    Result, Subscription, Transport, TransportOptions,
};

/// Connection attempts before giving up.
const CONNECT_ATTEMPTS: usize = 5;

/// Transport backed by a NATS server.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsTransport;

impl NatsTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Server list in the form accepted by the client: comma-separated URLs.
fn server_urls<S: AsRef<str>>(addresses: &[S]) -> String {
    addresses
        .iter()
        .map(|a| {
            let a = a.as_ref();
            if a.contains("://") {
                a.to_string()
            } else {
                format!("nats://{}", a)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn connect_options(options: &TransportOptions) -> async_nats::ConnectOptions {
    let mut connect = async_nats::ConnectOptions::new()
        .connection_timeout(options.dial_timeout)
        .ping_interval(options.heartbeat_interval)
        .require_tls(options.tls_v1);

    let name = if options.client_id.is_empty() {
        options.user_agent.as_str()
    } else {
        options.client_id.as_str()
    };
    connect = connect.name(name);

    if !options.auth_secret.is_empty() {
        connect = connect.token(options.auth_secret.clone());
    }
    connect
}

fn connection_backoff(options: &TransportOptions) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(options.max_backoff_duration)
        .with_max_times(CONNECT_ATTEMPTS)
        .with_jitter()
}

async fn connect(servers: String, options: &TransportOptions) -> Result<async_nats::Client> {
    let client = (|| {
        let servers = servers.clone();
        let connect = connect_options(options);
        async move { connect.connect(servers).await.map_err(|e| e.to_string()) }
    })
    .retry(connection_backoff(options))
    .notify(|err: &String, dur: Duration| {
        warn!(error = %err, delay = ?dur, "NATS connection failed, retrying");
    })
    .await
    .map_err(BusError::Connection)?;

    info!(servers = %servers, "Connected to NATS");
    Ok(client)
}

/// Publishing side of a NATS connection.
struct NatsPublisher {
    client: async_nats::Client,
    write_timeout: Duration,
}

impl NatsPublisher {
    async fn flush(client: &async_nats::Client, write_timeout: Duration) -> Result<()> {
        tokio::time::timeout(write_timeout, client.flush())
            .await
            .map_err(|_| BusError::Transport(format!("flush timed out after {:?}", write_timeout)))?
            .map_err(|e| BusError::Transport(e.to_string()))
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_string(), body)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Self::flush(&self.client, self.write_timeout).await
    }

    async fn publish_async(&self, topic: &str, body: Bytes) -> Result<PendingAck> {
        self.client
            .publish(topic.to_string(), body)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let client = self.client.clone();
        let write_timeout = self.write_timeout;
        Ok(Box::pin(async move { Self::flush(&client, write_timeout).await }))
    }
}

/// Wait until the server has processed every command sent so far on
/// `client`, the queue subscription included.
///
/// The server handles one connection's commands in order, so a message
/// published to a private inbox on the same connection comes back only after
/// the earlier SUB took effect.
async fn confirm_subscription(client: &async_nats::Client, timeout: Duration) -> Result<()> {
    let inbox = client.new_inbox();
    let mut echo = client
        .subscribe(inbox.clone())
        .await
        .map_err(|e| BusError::Connection(e.to_string()))?;
    client
        .publish(inbox, Bytes::new())
        .await
        .map_err(|e| BusError::Connection(e.to_string()))?;

    let confirmed = tokio::time::timeout(timeout, echo.next()).await;
    if let Err(e) = echo.unsubscribe().await {
        debug!(error = %e, "NATS confirmation inbox unsubscribe failed");
    }

    match confirmed {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(BusError::Connection(
            "connection closed before the subscription was confirmed".to_string(),
        )),
        Err(_) => Err(BusError::Connection(format!(
            "subscription not confirmed within {:?}",
            timeout
        ))),
    }
}

/// Log deliveries the handler asked to redeliver; NATS core cannot.
async fn report_requeue(subject: String, message_id: String, ack: oneshot::Receiver<Ack>) {
    if let Ok(Ack::Requeue(delay)) = ack.await {
        warn!(
            subject = %subject,
            message_id = %message_id,
            delay = ?delay,
            "Redelivery not supported by NATS core, message dropped"
        );
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect_publisher(
        &self,
        address: &str,
        settings: &BrokerSettings,
    ) -> Result<Arc<dyn Publisher>> {
        let options = TransportOptions::from(settings);
        let client = connect(server_urls(&[address]), &options).await?;

        Ok(Arc::new(NatsPublisher {
            client,
            write_timeout: options.write_timeout,
        }))
    }

    async fn connect_consumer(
        &self,
        topic: &str,
        group: &str,
        lookup: &[String],
        settings: &BrokerSettings,
    ) -> Result<Subscription> {
        let options = TransportOptions::from(settings);
        let client = connect(server_urls(lookup), &options).await?;

        let mut subscriber = client
            .queue_subscribe(topic.to_string(), group.to_string())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        confirm_subscription(&client, options.dial_timeout.max(options.write_timeout)).await?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let subject = topic.to_string();
        let queue = group.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = subscriber.next() => {
                        let Some(message) = message else {
                            debug!(subject = %subject, queue = %queue, "NATS subscription ended");
                            break;
                        };

                        let id = uuid::Uuid::new_v4().simple().to_string();
                        let (delivery, ack) = Delivery::new(id.clone(), message.payload, 1);
                        if tx.send(delivery).is_err() {
                            break;
                        }
                        tokio::spawn(report_requeue(subject.clone(), id, ack));
                    }
                }
            }

            if let Err(e) = subscriber.unsubscribe().await {
                debug!(subject = %subject, error = %e, "NATS unsubscribe failed");
            }
            // Keep the connection alive until the session ends.
            drop(client);
        });

        debug!(topic = %topic, group = %group, "NATS consumer connected");
        Ok(Subscription::new(inbound))
    }

    fn provisioner(&self, _address: &str) -> Result<Arc<dyn Provisioner>> {
        Ok(Arc::new(NoopProvisioner))
    }
}
