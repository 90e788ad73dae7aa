//! msgbus - request/reply messaging over publish/subscribe brokers.
//!
//! An [`Emitter`] publishes JSON envelopes to named destinations, either
//! waiting for the broker (`emit`), without waiting (`emit_async`), or as a
//! correlated request whose reply comes back through a one-shot ephemeral
//! topic (`request`, `call`). Every publish goes through a circuit breaker.
//!
//! [`listener::on`] subscribes a handler to a `(topic, channel)` pair and
//! dispatches deliveries to it on a pool of workers, publishing the handler's
//! return value to the envelope's reply destination when there is one.
//!
//! Brokers plug in through [`bus::Transport`]: an in-process broker
//! (`channel`, default), NATS (`nats` feature) and NSQ (`nsq` feature) are
//! provided.

pub mod breaker;
pub mod bus;
pub mod config;
pub mod emitter;
pub mod envelope;
pub mod listener;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use breaker::{Breaker, BreakerConfig, BreakerState};
pub use bus::{BusError, MessagingConfig, Result, Transport};
pub use emitter::{AsyncPublishError, Emitter, EmitterConfig};
pub use envelope::{Envelope, Message};
pub use listener::{handler_fn, on, reply, ListenerConfig, ListenerHandle, MessageHandler};
