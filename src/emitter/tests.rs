use super::*;
use crate::breaker::BreakerState;
use crate::bus::{ChannelTransport, MockTransport};
use crate::envelope::Envelope;
use crate::listener::reply;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

async fn emitter(transport: &MockTransport) -> Emitter {
    Emitter::new(Arc::new(transport.clone()), EmitterConfig::default())
        .await
        .unwrap()
}

fn noop_handler() -> Arc<dyn MessageHandler> {
    handler_fn(|_message| async { reply(&()) })
}

#[tokio::test]
async fn test_emit_publishes_envelope_without_reply_to() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;

    emitter.emit("orders", &json!({"Name": "created"})).await.unwrap();

    let published = transport.take_published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "orders");

    let envelope = Envelope::decode(&published[0].1).unwrap();
    assert_eq!(envelope.reply_to(), None);
    assert_eq!(
        envelope.decode_payload::<serde_json::Value>().unwrap(),
        json!({"Name": "created"})
    );
}

#[tokio::test]
async fn test_emit_twice_publishes_twice() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;

    emitter.emit("orders", &"same").await.unwrap();
    emitter.emit("orders", &"same").await.unwrap();

    assert_eq!(transport.published_count().await, 2);
}

#[tokio::test]
async fn test_empty_destination_rejected_before_publishing() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;

    assert!(matches!(
        emitter.emit("", &1).await,
        Err(BusError::DestinationRequired)
    ));
    assert!(matches!(
        emitter.emit_async("", &1).await,
        Err(BusError::DestinationRequired)
    ));
    assert!(matches!(
        emitter.request("", &1, Some(noop_handler())).await,
        Err(BusError::DestinationRequired)
    ));
    assert_eq!(transport.publish_calls().await, 0);
    assert!(transport.created_topics().await.is_empty());
}

#[tokio::test]
async fn test_request_without_handler_publishes_nothing() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;

    let result = emitter.request("orders", &1, None).await;
    assert!(matches!(result, Err(BusError::HandlerRequired)));
    assert_eq!(transport.publish_calls().await, 0);
    assert!(transport.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_connect_failure_is_connection_error() {
    let transport = MockTransport::new();
    transport.set_fail_on_connect(true).await;

    let result = Emitter::new(Arc::new(transport), EmitterConfig::default()).await;
    assert!(matches!(result, Err(BusError::Connection(_))));
}

#[tokio::test]
async fn test_empty_address_falls_back_to_default() {
    let transport = MockTransport::new();
    let config = EmitterConfig {
        address: String::new(),
        reply_timeout: Duration::ZERO,
        ..Default::default()
    };
    let emitter = Emitter::new(Arc::new(transport), config).await.unwrap();

    assert_eq!(emitter.config().address, DEFAULT_ADDRESS);
    assert_eq!(emitter.config().reply_timeout, DEFAULT_REPLY_TIMEOUT);
}

#[tokio::test]
async fn test_request_provisions_subscribes_then_publishes() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;

    emitter
        .request("orders", &json!({"Name": "created"}), Some(noop_handler()))
        .await
        .unwrap();

    let created = transport.created_topics().await;
    assert_eq!(created.len(), 1);
    let reply_to = &created[0];
    assert!(provision::is_ephemeral(reply_to));

    // Topic and group are both the reply destination.
    let subscriptions = transport.subscriptions().await;
    assert_eq!(subscriptions, vec![(reply_to.clone(), reply_to.clone())]);

    let published = transport.take_published().await;
    assert_eq!(published.len(), 1);
    let envelope = Envelope::decode(&published[0].1).unwrap();
    assert_eq!(envelope.reply_to(), Some(reply_to.as_str()));
}

#[tokio::test]
async fn test_concurrent_requests_use_distinct_reply_destinations() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;

    let (a, b) = tokio::join!(
        emitter.request("orders", &1, Some(noop_handler())),
        emitter.request("orders", &2, Some(noop_handler())),
    );
    a.unwrap();
    b.unwrap();

    let created = transport.created_topics().await;
    assert_eq!(created.len(), 2);
    assert_ne!(created[0], created[1]);
}

#[tokio::test]
async fn test_request_provisioning_failure_aborts() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;
    transport.set_fail_on_provision(true).await;

    let result = emitter.request("orders", &1, Some(noop_handler())).await;
    assert!(matches!(result, Err(BusError::Connection(_))));
    assert!(transport.subscriptions().await.is_empty());
    assert_eq!(transport.publish_calls().await, 0);
}

#[tokio::test]
async fn test_request_publish_failure_tears_down_reply_subscription() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;
    transport.set_fail_on_publish(true).await;

    let result = emitter.request("orders", &1, Some(noop_handler())).await;
    assert!(matches!(result, Err(BusError::Transport(_))));

    let created = transport.created_topics().await;
    assert_eq!(transport.deleted_topics().await, created);
    assert!(transport.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_reply_handler_runs_once_and_subscription_ends() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler = handler_fn(move |_message| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { reply(&()) }
    });

    emitter.request("orders", &1, Some(handler)).await.unwrap();
    let reply_to = transport.created_topics().await[0].clone();

    let body = envelope::encode(&json!({"Name": "created_ack"}), None).unwrap();
    let ack = transport.deliver(&reply_to, body).await.unwrap();
    assert_eq!(ack.await.unwrap(), crate::bus::Ack::Finish);

    tokio::time::timeout(Duration::from_secs(1), async {
        while transport.deleted_topics().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reply topic torn down");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(transport.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_reply_subscription_expires() {
    let transport = MockTransport::new();
    let config = EmitterConfig {
        reply_timeout: Duration::from_millis(30),
        ..Default::default()
    };
    let emitter = Emitter::new(Arc::new(transport.clone()), config).await.unwrap();

    emitter.request("orders", &1, Some(noop_handler())).await.unwrap();
    assert_eq!(transport.subscriptions().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(transport.subscriptions().await.is_empty());
    assert_eq!(transport.deleted_topics().await.len(), 1);
}

#[tokio::test]
async fn test_call_times_out_without_responder() {
    let transport = ChannelTransport::new();
    let emitter = Emitter::new(Arc::new(transport), EmitterConfig::default())
        .await
        .unwrap();

    let result: Result<String> = emitter
        .call("nobody-home", &"ping", Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(BusError::ReplyTimeout { .. })));
}

#[tokio::test]
async fn test_breaker_opens_and_fails_fast() {
    let transport = MockTransport::new();
    let config = EmitterConfig {
        breaker: BreakerConfig::named("emitter").with_threshold(2),
        ..Default::default()
    };
    let emitter = Emitter::new(Arc::new(transport.clone()), config).await.unwrap();
    transport.set_fail_on_publish(true).await;

    for _ in 0..3 {
        assert!(matches!(
            emitter.emit("orders", &1).await,
            Err(BusError::Transport(_))
        ));
    }
    assert_eq!(emitter.breaker().state(), BreakerState::Open);

    let result = emitter.emit("orders", &1).await;
    assert!(matches!(result, Err(BusError::CircuitOpen { ref name }) if name == "emitter"));
    assert_eq!(transport.publish_calls().await, 3);
}

#[tokio::test]
async fn test_emit_async_returns_before_ack() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;

    emitter.emit_async("orders", &"fast").await.unwrap();
    assert_eq!(transport.published_count().await, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(emitter.breaker().counts().total_successes, 1);
}

#[tokio::test]
async fn test_emit_async_failure_is_reported_not_fatal() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;
    let mut errors = emitter.async_errors();
    transport.set_fail_on_publish_async(true).await;

    emitter.emit_async("orders", &"lost").await.unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.destination, "orders");
    assert_eq!(emitter.breaker().counts().total_failures, 1);

    // The emitter keeps working.
    transport.set_fail_on_publish_async(false).await;
    emitter.emit("orders", &"next").await.unwrap();
}

#[tokio::test]
async fn test_clones_share_breaker() {
    let transport = MockTransport::new();
    let emitter = emitter(&transport).await;
    let clone = emitter.clone();

    clone.emit("orders", &1).await.unwrap();
    assert_eq!(emitter.breaker().counts().total_successes, 1);
    assert_eq!(transport.publisher_connections().await, 1);
}
