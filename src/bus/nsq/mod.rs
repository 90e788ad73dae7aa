//! NSQ transport.
//!
//! Publishers hold one connection to an nsqd; consumers discover the nsqd
//! instances carrying their topic through nsqlookupd and subscribe to each
//! one. Topics are pre-created through nsqd's HTTP API on the data port + 1.
//!
//! # Configuration
//!
//! ```yaml
//! messaging:
//!   type: nsq
//!   address: "localhost:4150"
//!   lookup: ["localhost:4161"]
//!   settings:
//!     max_in_flight: 16
//!     lookupd_poll_interval_ms: 15000
//! ```
//!
//! TLS, deflate and snappy connection upgrades are not supported; enabling
//! any of them fails the connection.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    Ack, BrokerSettings, BusError, Delivery, PendingAck, Publisher, Result, Subscription,
    Transport, TransportOptions,
};

pub mod lookup;
pub mod protocol;

use lookup::Lookup;
use protocol::{
    ensure_supported, handshake, round_trip, server_error, validate_name, Command, CommandWriter,
    Frame, FrameReader, ServerFeatures, CLOSE_WAIT,
};

/// Connection attempts before a publisher gives up.
const CONNECT_ATTEMPTS: usize = 5;
/// First retry of a consumer's discovery while it has no connection.
const MIN_DISCOVERY_RETRY: Duration = Duration::from_millis(100);

type Reader = FrameReader<OwnedReadHalf>;
type Writer = CommandWriter<OwnedWriteHalf>;

/// Transport backed by nsqd / nsqlookupd.
#[derive(Debug, Clone, Copy, Default)]
pub struct NsqTransport;

impl NsqTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Open a TCP connection to nsqd and complete the handshake.
async fn connect(address: &str, options: &TransportOptions) -> Result<(Reader, Writer, ServerFeatures)> {
    let stream = tokio::time::timeout(options.dial_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            BusError::Connection(format!(
                "connecting to nsqd at {} timed out after {:?}",
                address, options.dial_timeout
            ))
        })?
        .map_err(|e| BusError::Connection(format!("connecting to nsqd at {}: {}", address, e)))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(address = %address, error = %e, "TCP_NODELAY not set");
    }

    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read, options.read_timeout);
    let mut writer = CommandWriter::new(write, options.write_timeout);
    let features = handshake(&mut reader, &mut writer, options).await?;

    debug!(address = %address, version = %features.version, max_rdy_count = features.max_rdy_count, "nsqd handshake complete");
    Ok((reader, writer, features))
}

fn connection_backoff(options: &TransportOptions) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(options.max_backoff_duration)
        .with_max_times(CONNECT_ATTEMPTS)
        .with_jitter()
}

/// Move frames off the socket so the connection loop can select on them.
async fn forward_frames(mut reader: Reader, frames: mpsc::Sender<Result<Frame>>) {
    loop {
        let frame = reader.next().await;
        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            return;
        }
    }
}

fn spawn_reader(reader: Reader) -> (mpsc::Receiver<Result<Frame>>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(forward_frames(reader, tx));
    (rx, task)
}

// ============================================================================
// Publisher
// ============================================================================

/// A publish waiting for nsqd's response.
struct Outbound {
    command: Command,
    ack: oneshot::Sender<Result<()>>,
}

/// Publishing side of an nsqd connection. Reconnects on the next publish
/// after the connection was lost.
struct NsqPublisher {
    address: String,
    options: TransportOptions,
    connection: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl NsqPublisher {
    async fn open(address: &str, options: &TransportOptions) -> Result<mpsc::UnboundedSender<Outbound>> {
        let (reader, writer, _features) = connect(address, options).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_producer(address.to_string(), reader, writer, rx));
        Ok(tx)
    }

    async fn sender(&self) -> Result<mpsc::UnboundedSender<Outbound>> {
        let mut connection = self.connection.lock().await;
        if let Some(tx) = connection.as_ref().filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }

        info!(address = %self.address, "Reconnecting to nsqd");
        let tx = Self::open(&self.address, &self.options).await?;
        *connection = Some(tx.clone());
        Ok(tx)
    }
}

#[async_trait]
impl Publisher for NsqPublisher {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        self.publish_async(topic, body).await?.await
    }

    async fn publish_async(&self, topic: &str, body: Bytes) -> Result<PendingAck> {
        validate_name("topic", topic)?;

        let (ack, response) = oneshot::channel();
        let outbound = Outbound {
            command: Command::Pub {
                topic: topic.to_string(),
                body,
            },
            ack,
        };
        self.sender()
            .await?
            .send(outbound)
            .map_err(|_| BusError::Transport("nsqd connection closed".to_string()))?;

        Ok(Box::pin(async move {
            response.await.map_err(|_| {
                BusError::Transport("nsqd connection closed before acknowledging".to_string())
            })?
        }))
    }
}

/// Producer connection loop: writes publishes in order and matches each
/// response to the oldest unanswered one.
async fn run_producer(
    address: String,
    reader: Reader,
    mut writer: Writer,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (mut frames, read_task) = spawn_reader(reader);
    let mut pending: VecDeque<oneshot::Sender<Result<()>>> = VecDeque::new();

    let failure = loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(Ok(frame)) if frame.is_heartbeat() => {
                    if let Err(e) = writer.send(&Command::Nop).await {
                        break Some(e);
                    }
                }
                Some(Ok(Frame::Response(_))) => {
                    if let Some(ack) = pending.pop_front() {
                        let _ = ack.send(Ok(()));
                    }
                }
                Some(Ok(Frame::Error(data))) => match pending.pop_front() {
                    Some(ack) => {
                        let _ = ack.send(Err(server_error(&data)));
                    }
                    None => break Some(server_error(&data)),
                },
                Some(Ok(Frame::Message(message))) => {
                    break Some(BusError::Transport(format!(
                        "unexpected message {} on a producer connection",
                        message.id
                    )));
                }
                Some(Err(e)) => break Some(e),
                None => break Some(BusError::Transport("nsqd connection closed".to_string())),
            },
            next = outbound.recv() => match next {
                Some(Outbound { command, ack }) => match writer.send(&command).await {
                    Ok(()) => pending.push_back(ack),
                    Err(e) => {
                        let _ = ack.send(Err(BusError::Transport(e.to_string())));
                        break Some(e);
                    }
                },
                None => {
                    let _ = writer.send(&Command::Cls).await;
                    break None;
                }
            },
        }
    };

    read_task.abort();
    match failure {
        Some(e) => {
            warn!(address = %address, error = %e, unanswered = pending.len(), "nsqd producer connection lost");
            for ack in pending.drain(..) {
                let _ = ack.send(Err(BusError::Transport(format!(
                    "nsqd connection to {} lost: {}",
                    address, e
                ))));
            }
        }
        None => debug!(address = %address, "nsqd producer connection closed"),
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// RDY count for one connection of a consumer.
///
/// Connections idle past `low_rdy_idle_timeout` are held at 1 so the rest
/// of `max_in_flight` goes to busy ones. Every connection keeps at least 1.
fn rdy_target(max_in_flight: usize, connections: usize, idle: usize, this_idle: bool) -> u64 {
    let connections = connections.max(1);
    let idle = idle.min(connections);
    if this_idle && connections > 1 {
        return 1;
    }
    let busy = (connections - idle).max(1);
    let share = max_in_flight.saturating_sub(idle) / busy;
    share.max(1) as u64
}

/// Pause applied after failed messages: each failure doubles it, up to the
/// configured maximum; each success undoes one failure.
#[derive(Debug, Clone)]
struct Backoff {
    multiplier: Duration,
    max: Duration,
    level: u32,
}

impl Backoff {
    fn new(options: &TransportOptions) -> Self {
        Self {
            multiplier: options.backoff_multiplier,
            max: options.max_backoff_duration,
            level: 0,
        }
    }

    fn is_active(&self) -> bool {
        self.level > 0
    }

    fn failure(&mut self) {
        self.level = self.level.saturating_add(1);
    }

    fn success(&mut self) {
        self.level = self.level.saturating_sub(1);
    }

    fn delay(&self) -> Duration {
        let exponent = self.level.saturating_sub(1).min(31);
        self.multiplier
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

/// State shared by the connections of one consumer session.
struct ConsumerState {
    topic: String,
    channel: String,
    options: TransportOptions,
    connections: AtomicUsize,
    idle: AtomicUsize,
    addresses: Mutex<HashSet<String>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn rdy_target(&self, this_idle: bool, features: &ServerFeatures) -> u64 {
        rdy_target(
            self.options.max_in_flight,
            self.connections.load(Ordering::Relaxed),
            self.idle.load(Ordering::Relaxed),
            this_idle,
        )
        .min(features.max_rdy_count)
    }

    /// Connect to every producer of the topic not connected yet.
    async fn discover(self: &Arc<Self>, lookup: &Lookup) {
        for address in lookup.producers(&self.topic).await {
            if self.addresses.lock().await.contains(&address) {
                continue;
            }

            match ConsumerConnection::open(Arc::clone(self), &address).await {
                Ok(connection) => {
                    self.addresses.lock().await.insert(address.clone());
                    self.connections.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(connection.run());
                }
                Err(e) => {
                    warn!(address = %address, topic = %self.topic, channel = %self.channel, error = %e, "nsqd subscription failed");
                }
            }
        }
    }

    async fn is_disconnected(&self) -> bool {
        self.addresses.lock().await.is_empty()
    }
}

/// Re-query the lookupds until the session ends.
async fn poll_lookup(state: Arc<ConsumerState>, lookup: Lookup) {
    let interval = state.options.lookupd_poll_interval;
    let jitter = state.options.lookupd_poll_jitter.clamp(0.0, 1.0);
    let mut retry = MIN_DISCOVERY_RETRY;
    let mut delay = if state.is_disconnected().await {
        retry
    } else {
        interval.mul_f64(jitter * rand::random::<f64>())
    };

    loop {
        tokio::select! {
            _ = state.deliveries.closed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        state.discover(&lookup).await;

        delay = if state.is_disconnected().await {
            retry = (retry * 2).min(interval);
            retry
        } else {
            retry = MIN_DISCOVERY_RETRY;
            interval
        };
    }
    debug!(topic = %state.topic, channel = %state.channel, "nsq lookup polling stopped");
}

/// One subscribed nsqd connection.
struct ConsumerConnection {
    state: Arc<ConsumerState>,
    address: String,
    reader: Reader,
    writer: Writer,
    features: ServerFeatures,
}

impl ConsumerConnection {
    async fn open(state: Arc<ConsumerState>, address: &str) -> Result<Self> {
        let (mut reader, mut writer, features) = connect(address, &state.options).await?;
        let sub = Command::Sub {
            topic: state.topic.clone(),
            channel: state.channel.clone(),
        };
        round_trip(&mut reader, &mut writer, &sub).await?;

        debug!(address = %address, topic = %state.topic, channel = %state.channel, "nsq consumer subscribed");
        Ok(Self {
            state,
            address: address.to_string(),
            reader,
            writer,
            features,
        })
    }

    async fn run(self) {
        let Self {
            state,
            address,
            reader,
            mut writer,
            features,
        } = self;

        if let Err(e) = consume(&state, &address, reader, &mut writer, &features).await {
            warn!(address = %address, topic = %state.topic, channel = %state.channel, error = %e, "nsq consumer connection lost");
        }

        state.addresses.lock().await.remove(&address);
        state.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

type InFlight = FuturesUnordered<BoxFuture<'static, (String, Ack)>>;

async fn consume(
    state: &ConsumerState,
    address: &str,
    reader: Reader,
    writer: &mut Writer,
    features: &ServerFeatures,
) -> Result<()> {
    let options = &state.options;
    let (mut frames, read_task) = spawn_reader(reader);
    let _abort_reader = AbortOnDrop(read_task);

    let mut in_flight = InFlight::new();
    let mut backoff = Backoff::new(options);
    let mut paused = false;
    let resume = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(resume);
    let mut redistribute = tokio::time::interval(options.rdy_redistribute_interval);
    redistribute.tick().await;

    let mut idle = false;
    let mut last_message = Instant::now();
    let mut rdy = state.rdy_target(false, features);
    writer.send(&Command::Rdy(rdy)).await?;

    loop {
        tokio::select! {
            _ = state.deliveries.closed() => {
                writer.send(&Command::Cls).await?;
                return Ok(());
            }
            frame = frames.recv() => {
                let frame = frame.ok_or_else(|| BusError::Transport("nsqd connection closed".to_string()))??;
                match frame {
                    frame if frame.is_heartbeat() => writer.send(&Command::Nop).await?,
                    Frame::Response(data) if data.as_ref() == CLOSE_WAIT => return Ok(()),
                    Frame::Response(_) => {}
                    Frame::Error(data) => {
                        // FIN/REQ for an expired message; nsqd already redelivers it.
                        warn!(address = %address, error = %String::from_utf8_lossy(&data), "nsqd reported an error");
                    }
                    Frame::Message(message) => {
                        last_message = Instant::now();
                        if idle {
                            idle = false;
                            state.idle.fetch_sub(1, Ordering::Relaxed);
                        }

                        if options.max_attempts != 0 && message.attempts > options.max_attempts {
                            warn!(
                                topic = %state.topic,
                                channel = %state.channel,
                                message_id = %message.id,
                                attempts = message.attempts,
                                "Giving up on message after max attempts"
                            );
                            writer.send(&Command::Fin(message.id)).await?;
                            continue;
                        }

                        let (delivery, ack) = Delivery::new(message.id.clone(), message.body, message.attempts);
                        if state.deliveries.send(delivery).is_err() {
                            writer.send(&Command::Cls).await?;
                            return Ok(());
                        }
                        let id = message.id;
                        in_flight.push(Box::pin(async move {
                            (id, ack.await.unwrap_or(Ack::Requeue(Duration::ZERO)))
                        }));
                    }
                }
            }
            Some((id, ack)) = in_flight.next(), if !in_flight.is_empty() => {
                match ack {
                    Ack::Finish => {
                        writer.send(&Command::Fin(id)).await?;
                        if backoff.is_active() {
                            backoff.success();
                            if backoff.is_active() {
                                rdy = pause(writer, &mut resume, backoff.delay()).await?;
                                paused = true;
                            } else {
                                rdy = state.rdy_target(idle, features);
                                writer.send(&Command::Rdy(rdy)).await?;
                                paused = false;
                            }
                        }
                    }
                    Ack::Requeue(delay) => {
                        let delay = delay.min(options.max_requeue_delay);
                        writer.send(&Command::Req { id, delay }).await?;
                        backoff.failure();
                        rdy = pause(writer, &mut resume, backoff.delay()).await?;
                        paused = true;
                    }
                }
            }
            _ = &mut resume, if paused => {
                // One trial message decides whether to leave backoff.
                paused = false;
                rdy = 1;
                writer.send(&Command::Rdy(rdy)).await?;
            }
            _ = redistribute.tick() => {
                let now_idle = state.connections.load(Ordering::Relaxed) > 1
                    && last_message.elapsed() >= options.low_rdy_idle_timeout;
                if now_idle != idle {
                    idle = now_idle;
                    if idle {
                        state.idle.fetch_add(1, Ordering::Relaxed);
                    } else {
                        state.idle.fetch_sub(1, Ordering::Relaxed);
                    }
                }

                if !paused && !backoff.is_active() {
                    let target = state.rdy_target(idle, features);
                    if target != rdy {
                        rdy = target;
                        writer.send(&Command::Rdy(rdy)).await?;
                    }
                }
            }
        }
    }
}

/// Stop deliveries on this connection until `resume` fires.
async fn pause(
    writer: &mut Writer,
    resume: &mut std::pin::Pin<&mut tokio::time::Sleep>,
    delay: Duration,
) -> Result<u64> {
    writer.send(&Command::Rdy(0)).await?;
    resume.as_mut().reset(Instant::now() + delay);
    Ok(0)
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl Transport for NsqTransport {
    async fn connect_publisher(
        &self,
        address: &str,
        settings: &BrokerSettings,
    ) -> Result<Arc<dyn Publisher>> {
        let options = TransportOptions::from(settings);
        ensure_supported(&options)?;

        let tx = (|| NsqPublisher::open(address, &options))
            .retry(connection_backoff(&options))
            .when(|e: &BusError| e.is_retryable())
            .notify(|e: &BusError, dur: Duration| {
                warn!(address = %address, error = %e, delay = ?dur, "nsqd connection failed, retrying");
            })
            .await?;

        info!(address = %address, "Connected to nsqd");
        Ok(Arc::new(NsqPublisher {
            address: address.to_string(),
            options,
            connection: Mutex::new(Some(tx)),
        }))
    }

    async fn connect_consumer(
        &self,
        topic: &str,
        group: &str,
        lookup: &[String],
        settings: &BrokerSettings,
    ) -> Result<Subscription> {
        validate_name("topic", topic)?;
        validate_name("channel", group)?;
        let options = TransportOptions::from(settings);
        ensure_supported(&options)?;
        let lookup = Lookup::new(lookup, &options)?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let state = Arc::new(ConsumerState {
            topic: topic.to_string(),
            channel: group.to_string(),
            options,
            connections: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            addresses: Mutex::new(HashSet::new()),
            deliveries: tx,
        });

        state.discover(&lookup).await;
        if state.is_disconnected().await {
            debug!(topic = %topic, channel = %group, "No nsqd carries the topic yet, polling lookup");
        }
        tokio::spawn(poll_lookup(state, lookup));

        debug!(topic = %topic, channel = %group, "nsq consumer connected");
        Ok(Subscription::new(inbound))
    }
}
