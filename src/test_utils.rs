//! Test utilities.
//!
//! Recording and failing message handlers plus small helpers shared by unit
//! and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::bus::BusError;
use crate::envelope::Message;
use crate::listener::{HandlerResult, MessageHandler};

/// Handler that records every message it receives and answers with a fixed
/// reply.
#[derive(Clone)]
pub struct RecordingHandler {
    received: Arc<RwLock<Vec<Message>>>,
    reply: Value,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::replying(&Value::Null)
    }
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler answering every message with `reply`.
    pub fn replying<T: Serialize + ?Sized>(reply: &T) -> Self {
        Self {
            received: Arc::new(RwLock::new(Vec::new())),
            reply: serde_json::to_value(reply).unwrap_or(Value::Null),
        }
    }

    /// Shareable handle for `ListenerConfig::with_handler` / `Emitter::request`.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(self.clone())
    }

    pub async fn count(&self) -> usize {
        self.received.read().await.len()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.received.read().await.clone()
    }

    /// Wait until at least `n` messages arrived. Returns false on timeout.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, move || async move { self.count().await >= n }).await
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult> {
        let received = Arc::clone(&self.received);
        let reply = self.reply.clone();
        Box::pin(async move {
            received.write().await.push(message);
            Ok(reply)
        })
    }
}

/// Handler that fails its first `failures` invocations, then succeeds.
#[derive(Clone)]
pub struct FlakyHandler {
    remaining_failures: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(self.clone())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MessageHandler for FlakyHandler {
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        Box::pin(async move {
            if fail {
                Err(BusError::Handler(format!(
                    "induced failure on attempt {}",
                    message.attempts()
                )))
            } else {
                Ok(Value::Null)
            }
        })
    }
}

/// Payload shaped like the events exchanged in examples and tests.
pub fn make_event(name: &str) -> Value {
    json!({ "Name": name })
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
