//! msgbus-echo: request responder
//!
//! Subscribes to a topic and answers every request with the payload it
//! carried. Useful as a smoke-test peer for `Emitter::request` / `call`.
//!
//! ## Configuration
//! - MSGBUS_CONFIG / config.yaml / MSGBUS__*: messaging configuration
//! - MSGBUS_ECHO_TOPIC: topic to serve (default "echo")
//! - MSGBUS_ECHO_GROUP: consumer group (default "echo")
//! - MSGBUS_LOG: tracing filter (default "info")

use tracing::info;

use msgbus::bus::init_transport;
use msgbus::config::Config;
use msgbus::utils::bootstrap::init_tracing;
use msgbus::{handler_fn, listener, Message};

const TOPIC_ENV_VAR: &str = "MSGBUS_ECHO_TOPIC";
const GROUP_ENV_VAR: &str = "MSGBUS_ECHO_GROUP";
const DEFAULT_NAME: &str = "echo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let topic = std::env::var(TOPIC_ENV_VAR).unwrap_or_else(|_| DEFAULT_NAME.to_string());
    let group = std::env::var(GROUP_ENV_VAR).unwrap_or_else(|_| DEFAULT_NAME.to_string());

    let transport = init_transport(&config.messaging).map_err(|e| e.to_string())?;

    let handler = handler_fn(|message: Message| async move {
        let payload: serde_json::Value = message.decode_payload()?;
        info!(message_id = %message.id(), reply_to = ?message.reply_to(), "Echoing request");
        Ok::<_, msgbus::BusError>(payload)
    });
    let listener_config = config
        .messaging
        .listener_config(topic.as_str(), group.as_str())
        .with_handler(handler);

    let handle = listener::on(transport, listener_config).await?;

    info!(topic = %topic, group = %group, "Echo responder running, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;

    handle.stop().await;
    Ok(())
}
