use super::*;
use std::time::Duration;

async fn consumer(transport: &ChannelTransport, topic: &str, group: &str) -> Subscription {
    transport
        .connect_consumer(topic, group, &[], &BrokerSettings::default())
        .await
        .unwrap()
}

async fn next(subscription: &mut Subscription) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .expect("delivery within timeout")
        .expect("subscription open")
}

async fn nothing_within(subscription: &mut Subscription, wait: Duration) -> bool {
    tokio::time::timeout(wait, subscription.next()).await.is_err()
}

#[tokio::test]
async fn test_channel_publish_reaches_subscriber() {
    let transport = ChannelTransport::new();
    let mut sub = consumer(&transport, "orders", "billing").await;

    transport.publish("orders", Bytes::from_static(b"one")).await.unwrap();

    let delivery = next(&mut sub).await;
    assert_eq!(delivery.body, Bytes::from_static(b"one"));
    assert_eq!(delivery.attempts, 1);
    delivery.finish();
}

#[tokio::test]
async fn test_channel_publish_empty_topic_rejected() {
    let transport = ChannelTransport::new();
    let result = transport.publish("", Bytes::new()).await;
    assert!(matches!(result, Err(BusError::Transport(_))));
    assert!(transport.publish_async("", Bytes::new()).await.is_err());
}

#[tokio::test]
async fn test_channel_each_group_gets_a_copy() {
    let transport = ChannelTransport::new();
    let mut billing = consumer(&transport, "orders", "billing").await;
    let mut shipping = consumer(&transport, "orders", "shipping").await;

    transport.publish("orders", Bytes::from_static(b"one")).await.unwrap();

    next(&mut billing).await.finish();
    next(&mut shipping).await.finish();
}

#[tokio::test]
async fn test_channel_round_robin_within_group() {
    let transport = ChannelTransport::new();
    let mut first = consumer(&transport, "orders", "billing").await;
    let mut second = consumer(&transport, "orders", "billing").await;

    for body in ["a", "b", "c", "d"] {
        transport.publish("orders", Bytes::from(body)).await.unwrap();
    }

    for _ in 0..2 {
        next(&mut first).await.finish();
        next(&mut second).await.finish();
    }
    assert!(nothing_within(&mut first, Duration::from_millis(20)).await);
    assert!(nothing_within(&mut second, Duration::from_millis(20)).await);
}

#[tokio::test]
async fn test_channel_holds_messages_until_first_group_subscribes() {
    let transport = ChannelTransport::new();
    transport.publish("orders", Bytes::from_static(b"early")).await.unwrap();
    assert_eq!(transport.pending("orders").await, 1);

    let mut sub = consumer(&transport, "orders", "billing").await;
    assert_eq!(next(&mut sub).await.body, Bytes::from_static(b"early"));

    // Later groups only see messages published after they joined.
    let mut late = consumer(&transport, "orders", "audit").await;
    assert!(nothing_within(&mut late, Duration::from_millis(20)).await);
}

#[tokio::test]
async fn test_channel_group_backlog_waits_for_subscriber() {
    let transport = ChannelTransport::new();
    let sub = consumer(&transport, "orders", "billing").await;
    drop(sub);

    transport.publish("orders", Bytes::from_static(b"queued")).await.unwrap();
    assert_eq!(transport.pending("orders").await, 1);

    let mut sub = consumer(&transport, "orders", "billing").await;
    assert_eq!(next(&mut sub).await.body, Bytes::from_static(b"queued"));
    assert_eq!(transport.pending("orders").await, 0);
}

#[tokio::test]
async fn test_channel_requeue_redelivers_with_attempts() {
    let transport = ChannelTransport::new();
    let mut sub = consumer(&transport, "orders", "billing").await;

    transport.publish("orders", Bytes::from_static(b"retry")).await.unwrap();

    let first = next(&mut sub).await;
    let id = first.id.clone();
    first.requeue(Duration::from_millis(10));

    let second = next(&mut sub).await;
    assert_eq!(second.id, id);
    assert_eq!(second.attempts, 2);
    second.finish();

    assert!(nothing_within(&mut sub, Duration::from_millis(30)).await);
}

#[tokio::test]
async fn test_channel_dropped_delivery_is_redelivered() {
    let transport = ChannelTransport::new();
    let mut sub = consumer(&transport, "orders", "billing").await;

    transport.publish("orders", Bytes::from_static(b"dropped")).await.unwrap();
    drop(next(&mut sub).await);

    assert_eq!(next(&mut sub).await.attempts, 2);
}

#[tokio::test]
async fn test_channel_gives_up_after_max_attempts() {
    let transport = ChannelTransport::new();
    let settings = BrokerSettings {
        max_attempts: Some(2),
        ..Default::default()
    };
    let mut sub = transport
        .connect_consumer("orders", "billing", &[], &settings)
        .await
        .unwrap();

    transport.publish("orders", Bytes::from_static(b"poison")).await.unwrap();

    next(&mut sub).await.requeue(Duration::ZERO);
    next(&mut sub).await.requeue(Duration::ZERO);
    assert!(nothing_within(&mut sub, Duration::from_millis(50)).await);
}

#[tokio::test]
async fn test_channel_delete_topic_ends_sessions() {
    let transport = ChannelTransport::new();
    let mut sub = consumer(&transport, "abc.ephemeral", "abc.ephemeral").await;
    assert!(transport.topic_exists("abc.ephemeral").await);

    transport.delete_topic("abc.ephemeral").await.unwrap();

    assert!(!transport.topic_exists("abc.ephemeral").await);
    let closed = tokio::time::timeout(Duration::from_secs(1), sub.next()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_channel_create_topic_is_idempotent() {
    let transport = ChannelTransport::new();
    transport.create_topic("orders").await.unwrap();
    transport.create_topic("orders").await.unwrap();
    assert!(transport.topic_exists("orders").await);
    assert_eq!(transport.pending("orders").await, 0);
}

#[tokio::test]
async fn test_channel_publish_async_resolves_after_routing() {
    let transport = ChannelTransport::new();
    let mut sub = consumer(&transport, "orders", "billing").await;

    let ack = transport
        .publish_async("orders", Bytes::from_static(b"async"))
        .await
        .unwrap();
    ack.await.unwrap();

    assert_eq!(next(&mut sub).await.body, Bytes::from_static(b"async"));
}

#[tokio::test]
async fn test_channel_subscriber_count_ignores_closed_sessions() {
    let transport = ChannelTransport::new();
    let _first = consumer(&transport, "orders", "billing").await;
    let second = consumer(&transport, "orders", "billing").await;
    assert_eq!(transport.subscriber_count("orders", "billing").await, 2);

    drop(second);
    assert_eq!(transport.subscriber_count("orders", "billing").await, 1);
}

#[tokio::test]
async fn test_channel_consumer_requires_group() {
    let transport = ChannelTransport::new();
    let result = transport
        .connect_consumer("orders", "", &[], &BrokerSettings::default())
        .await;
    assert!(matches!(result, Err(BusError::Transport(_))));
}

#[tokio::test]
async fn test_channel_clones_share_broker() {
    let transport = ChannelTransport::new();
    let publisher = transport
        .clone()
        .connect_publisher("localhost:4150", &BrokerSettings::default())
        .await
        .unwrap();
    let mut sub = consumer(&transport, "orders", "billing").await;

    publisher.publish("orders", Bytes::from_static(b"shared")).await.unwrap();
    next(&mut sub).await.finish();
}

async fn topic_gone(transport: &ChannelTransport, topic: &str) -> bool {
    tokio::time::timeout(Duration::from_secs(1), async {
        while transport.topic_exists(topic).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_channel_reply_to_deleted_ephemeral_topic_is_dropped() {
    let transport = ChannelTransport::new();
    let sub = consumer(&transport, "abc.ephemeral", "abc.ephemeral").await;
    drop(sub);
    transport.delete_topic("abc.ephemeral").await.unwrap();

    transport
        .publish("abc.ephemeral", Bytes::from_static(b"late"))
        .await
        .unwrap();

    assert!(!transport.topic_exists("abc.ephemeral").await);
    assert_eq!(transport.pending("abc.ephemeral").await, 0);
}

#[tokio::test]
async fn test_channel_ephemeral_topic_without_subscribers_drops_message() {
    let transport = ChannelTransport::new();
    transport.create_topic("abc.ephemeral").await.unwrap();

    transport
        .publish("abc.ephemeral", Bytes::from_static(b"unwanted"))
        .await
        .unwrap();

    assert!(!transport.topic_exists("abc.ephemeral").await);
    assert_eq!(transport.pending("abc.ephemeral").await, 0);
}

#[tokio::test]
async fn test_channel_ephemeral_topic_removed_after_last_subscriber() {
    let transport = ChannelTransport::new();
    let first = consumer(&transport, "abc.ephemeral", "abc.ephemeral").await;
    let second = consumer(&transport, "abc.ephemeral", "abc.ephemeral").await;

    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.topic_exists("abc.ephemeral").await);

    drop(second);
    assert!(topic_gone(&transport, "abc.ephemeral").await);
}

#[tokio::test]
async fn test_channel_durable_topic_outlives_its_subscribers() {
    let transport = ChannelTransport::new();
    drop(consumer(&transport, "orders", "billing").await);

    transport.publish("orders", Bytes::from_static(b"kept")).await.unwrap();

    assert!(transport.topic_exists("orders").await);
    assert_eq!(transport.pending("orders").await, 1);
}
