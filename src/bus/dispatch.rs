//! Delivery dispatch.
//!
//! Handles the complete decode → handle → reply cycle for one delivery and
//! reports how the broker should be answered.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use super::{Delivery, Result, Transport};
use crate::emitter::{Emitter, EmitterConfig};
use crate::envelope::{Envelope, Message};
use crate::listener::MessageHandler;

/// Result of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Handler succeeded and no reply was requested.
    Success,
    /// Handler succeeded and its reply was published.
    Replied,
    /// Handler returned an error.
    HandlerFailed,
    /// Body was not a well-formed envelope.
    DecodeError,
    /// Handler succeeded but its reply could not be published.
    ReplyFailed,
}

impl DispatchResult {
    /// Whether the delivery is finished; everything else is requeued so the
    /// broker's redelivery policy applies.
    pub fn should_finish(&self) -> bool {
        matches!(self, Self::Success | Self::Replied)
    }
}

/// Emitter used by a listener to publish replies, connected on first use.
pub struct ReplyEmitter {
    transport: Arc<dyn Transport>,
    config: EmitterConfig,
    emitter: OnceCell<Emitter>,
}

impl ReplyEmitter {
    pub fn new(transport: Arc<dyn Transport>, config: EmitterConfig) -> Self {
        Self {
            transport,
            config,
            emitter: OnceCell::new(),
        }
    }

    /// Publish `value` to `reply_to`. Replies never carry a reply destination.
    pub async fn reply(&self, reply_to: &str, value: &serde_json::Value) -> Result<()> {
        let emitter = self
            .emitter
            .get_or_try_init(|| Emitter::new(Arc::clone(&self.transport), self.config.clone()))
            .await?;
        emitter.emit(reply_to, value).await
    }
}

/// Decode `delivery`, run `handler` and publish its reply if one was asked for.
pub async fn process_delivery(
    delivery: &Delivery,
    handler: &dyn MessageHandler,
    replies: &ReplyEmitter,
) -> DispatchResult {
    let envelope = match Envelope::decode(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(message_id = %delivery.id, error = %e, "Failed to decode envelope");
            return DispatchResult::DecodeError;
        }
    };

    let reply_to = envelope.reply_to().map(str::to_owned);
    let message = Message::new(delivery.id.clone(), delivery.attempts, envelope);

    let value = match handler.handle(message).await {
        Ok(value) => value,
        Err(e) => {
            warn!(message_id = %delivery.id, attempts = delivery.attempts, error = %e, "Handler failed");
            return DispatchResult::HandlerFailed;
        }
    };

    let Some(reply_to) = reply_to else {
        return DispatchResult::Success;
    };

    match replies.reply(&reply_to, &value).await {
        Ok(()) => {
            debug!(message_id = %delivery.id, reply_to = %reply_to, "Reply published");
            DispatchResult::Replied
        }
        Err(e) => {
            error!(message_id = %delivery.id, reply_to = %reply_to, error = %e, "Failed to publish reply");
            DispatchResult::ReplyFailed
        }
    }
}
