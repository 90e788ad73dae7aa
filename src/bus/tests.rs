use super::*;

#[test]
fn test_delivery_finish_reports_once() {
    let (delivery, mut ack) = Delivery::new("m-1", Bytes::from_static(b"{}"), 1);
    delivery.finish();
    assert_eq!(ack.try_recv().unwrap(), Ack::Finish);
}

#[test]
fn test_delivery_requeue_carries_delay() {
    let (delivery, mut ack) = Delivery::new("m-1", Bytes::new(), 3);
    delivery.requeue(Duration::from_secs(90));
    assert_eq!(ack.try_recv().unwrap(), Ack::Requeue(Duration::from_secs(90)));
}

#[test]
fn test_dropped_delivery_requeues_immediately() {
    let (delivery, mut ack) = Delivery::new("m-1", Bytes::new(), 1);
    drop(delivery);
    assert_eq!(ack.try_recv().unwrap(), Ack::Requeue(Duration::ZERO));
}

#[tokio::test]
async fn test_subscription_ends_when_sender_dropped() {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subscription = Subscription::new(rx);

    let (delivery, _ack) = Delivery::new("m-1", Bytes::new(), 1);
    tx.send(delivery).unwrap();
    drop(tx);

    assert!(subscription.next().await.is_some());
    assert!(subscription.next().await.is_none());
}

#[test]
fn test_retryable_errors() {
    assert!(BusError::Connection("refused".into()).is_retryable());
    assert!(BusError::Transport("closed".into()).is_retryable());
    assert!(BusError::CircuitOpen {
        name: "emitter".into()
    }
    .is_retryable());
    assert!(BusError::ReplyTimeout {
        destination: "svc".into(),
        timeout: Duration::from_secs(1),
    }
    .is_retryable());

    assert!(!BusError::DestinationRequired.is_retryable());
    assert!(!BusError::HandlerRequired.is_retryable());
    assert!(!BusError::Handler("nope".into()).is_retryable());
}

#[test]
fn test_messaging_config_defaults() {
    let config = MessagingConfig::default();
    assert_eq!(config.transport_type, TransportType::Channel);
    assert_eq!(config.address, DEFAULT_ADDRESS);
    assert_eq!(config.lookup, vec![DEFAULT_LOOKUP.to_string()]);
    assert!(config.admin_address.is_none());
}

#[test]
fn test_emitter_config_from_messaging() {
    let config = MessagingConfig {
        address: "broker:5150".into(),
        reply_timeout_ms: 0,
        ..Default::default()
    };
    let emitter = config.emitter_config();

    assert_eq!(emitter.address, "broker:5150");
    assert_eq!(emitter.reply_timeout, DEFAULT_REPLY_TIMEOUT);
    assert_eq!(emitter.breaker.name, "emitter");
}

#[test]
fn test_listener_config_from_messaging() {
    let config = MessagingConfig {
        lookup: vec!["lookup-a:4161".into(), "lookup-b:4161".into()],
        reply_timeout_ms: 1500,
        ..Default::default()
    };
    let listener = config.listener_config("orders", "billing");

    assert_eq!(listener.topic, "orders");
    assert_eq!(listener.channel, "billing");
    assert_eq!(listener.lookup.len(), 2);
    assert_eq!(listener.concurrency, 1);
    assert!(listener.handler.is_none());
    assert_eq!(listener.reply.reply_timeout, Duration::from_millis(1500));
}

#[test]
fn test_transport_type_deserializes_lowercase() {
    let config: MessagingConfig = serde_json::from_str(r#"{"type": "nats"}"#).unwrap();
    assert_eq!(config.transport_type, TransportType::Nats);
    assert_eq!(config.address, DEFAULT_ADDRESS);

    let config: MessagingConfig = serde_json::from_str(r#"{"type": "nsq"}"#).unwrap();
    assert_eq!(config.transport_type, TransportType::Nsq);
}

#[cfg(feature = "channel")]
#[test]
fn test_init_transport_channel() {
    assert!(init_transport(&MessagingConfig::default()).is_ok());
}

#[cfg(not(feature = "nats"))]
#[test]
fn test_init_transport_nats_requires_feature() {
    let config = MessagingConfig {
        transport_type: TransportType::Nats,
        ..Default::default()
    };
    let err = init_transport(&config).err().unwrap();
    assert!(err.to_string().contains("--features nats"));
}

#[cfg(not(feature = "nsq"))]
#[test]
fn test_init_transport_nsq_requires_feature() {
    let config = MessagingConfig {
        transport_type: TransportType::Nsq,
        ..Default::default()
    };
    let err = init_transport(&config).err().unwrap();
    assert!(err.to_string().contains("--features nsq"));
}

#[cfg(feature = "nsq")]
#[test]
fn test_init_transport_nsq() {
    let config = MessagingConfig {
        transport_type: TransportType::Nsq,
        ..Default::default()
    };
    assert!(init_transport(&config).is_ok());
}
