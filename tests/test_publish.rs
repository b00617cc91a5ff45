//! Publish behaviour over both transports: per-topic streams, ordering,
//! acknowledgement timeouts, parallel dispatch and stream failure isolation.


use mqtt_quic_client::testing::Reachability;
use mqtt_quic_client::{
    ConnectionState, PublishError, PublishRequest, QoS, TransportType,
};
use std::time::{Duration, Instant};
use test_helpers::Harness;

async fn connected_tcp(harness: &Harness) -> mqtt_quic_client::ConnectionManager {
    harness.quic.set_reachability(Reachability::Refused);
    let manager = harness.manager();
    manager.connect().await.unwrap();
    assert_eq!(manager.stats().transport, Some(TransportType::TcpTls));
    manager
}

#[tokio::test]
async fn test_qos1_publish_is_acknowledged() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();

    manager
        .publish("sensors/1/temp", "21.5", QoS::AtLeastOnce)
        .await
        .unwrap();

    let published = harness.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "sensors/1/temp");
    assert_eq!(&published[0].payload[..], b"21.5");
    assert_eq!(published[0].qos, QoS::AtLeastOnce);
    let stats = manager.stats();
    assert!(stats.messages_sent >= 2); // CONNECT + PUBLISH
    assert!(stats.last_activity.is_some());
    manager.disconnect().await;
}

#[tokio::test]
async fn test_qos0_publish_returns_without_ack() {
    let harness = Harness::new();
    harness.broker.set_ack_publishes(false);
    let manager = harness.manager();
    manager.connect().await.unwrap();

    manager
        .publish("sensors/1/fire-and-forget", "x", QoS::AtMostOnce)
        .await
        .unwrap();

    assert!(
        test_helpers::eventually(Duration::from_secs(1), || harness.broker.published().len() == 1)
            .await
    );
    manager.disconnect().await;
}

#[tokio::test]
async fn test_each_topic_gets_its_own_stream() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();

    manager.publish("a", "1", QoS::AtLeastOnce).await.unwrap();
    manager.publish("b", "1", QoS::AtLeastOnce).await.unwrap();
    manager.publish("a", "2", QoS::AtLeastOnce).await.unwrap();

    let published = harness.broker.published();
    assert_eq!(published.len(), 3);
    assert_ne!(published[0].stream, published[1].stream);
    assert_eq!(published[0].stream, published[2].stream);
    assert_eq!(manager.stats().open_topic_streams, 2);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_messages_on_a_topic_arrive_in_order() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();

    for i in 0..50 {
        manager
            .publish("ordered/a", format!("{i}"), QoS::AtMostOnce)
            .await
            .unwrap();
        manager
            .publish("ordered/b", format!("{i}"), QoS::AtMostOnce)
            .await
            .unwrap();
    }

    assert!(
        test_helpers::eventually(Duration::from_secs(2), || harness.broker.published().len() == 100)
            .await
    );
    for topic in ["ordered/a", "ordered/b"] {
        let payloads: Vec<String> = harness
            .broker
            .payloads_for(topic)
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(payloads, expected, "out of order on {topic}");
    }
    manager.disconnect().await;
}

#[tokio::test]
async fn test_topics_beyond_stream_cap_share_control_stream() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.quic.max_topic_streams = 1;
    let manager = harness.manager_with(config);
    manager.connect().await.unwrap();

    manager.publish("capped/a", "1", QoS::AtLeastOnce).await.unwrap();
    manager.publish("capped/b", "1", QoS::AtLeastOnce).await.unwrap();
    manager.publish("capped/c", "1", QoS::AtLeastOnce).await.unwrap();

    let published = harness.broker.published();
    assert_eq!(published.len(), 3);
    assert_ne!(published[0].stream, published[1].stream);
    assert_eq!(published[1].stream, published[2].stream);
    assert_eq!(manager.stats().open_topic_streams, 1);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_missing_puback_times_out_without_dropping_connection() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();
    harness.broker.set_ack_publishes(false);

    let started = Instant::now();
    let err = manager
        .publish("sensors/slow", "x", QoS::AtLeastOnce)
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::OperationTimeout { ref topic, .. } if topic == "sensors/slow"));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(manager.state(), ConnectionState::Connected(TransportType::Quic));
    let stats = manager.stats();
    assert_eq!(stats.operation_timeouts, 1);
    assert_eq!(stats.publish_failures, 1);

    harness.broker.set_ack_publishes(true);
    manager
        .publish("sensors/slow", "y", QoS::AtLeastOnce)
        .await
        .unwrap();
    manager.disconnect().await;
}

#[tokio::test]
async fn test_parallel_publish_over_quic_is_concurrent() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();
    harness.broker.set_ack_delay(Duration::from_millis(200));

    let started = Instant::now();
    let results = manager
        .publish_parallel(vec![
            PublishRequest::new("fleet/1", "a", QoS::AtLeastOnce),
            PublishRequest::new("fleet/2", "b", QoS::AtLeastOnce),
            PublishRequest::new("fleet/3", "c", QoS::AtLeastOnce),
        ])
        .await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 3);
    assert!(results.values().all(|r| r.is_ok()), "{results:?}");
    assert!(
        elapsed < Duration::from_millis(550),
        "three acks delayed 200ms each should overlap, took {elapsed:?}"
    );
    manager.disconnect().await;
}

#[tokio::test]
async fn test_parallel_publish_over_tcp_is_sequential() {
    let harness = Harness::new();
    let manager = connected_tcp(&harness).await;
    harness.broker.set_ack_delay(Duration::from_millis(200));

    let started = Instant::now();
    let results = manager
        .publish_parallel(vec![
            PublishRequest::new("fleet/1", "a", QoS::AtLeastOnce),
            PublishRequest::new("fleet/2", "b", QoS::AtLeastOnce),
            PublishRequest::new("fleet/3", "c", QoS::AtLeastOnce),
        ])
        .await;

    assert!(results.values().all(|r| r.is_ok()), "{results:?}");
    assert!(started.elapsed() >= Duration::from_millis(600));
    let topics: Vec<String> = harness.broker.published().into_iter().map(|p| p.topic).collect();
    assert_eq!(topics, vec!["fleet/1", "fleet/2", "fleet/3"]);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_parallel_publish_reports_each_topic() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();

    let results = manager
        .publish_parallel(vec![
            PublishRequest::new("good/1", "a", QoS::AtLeastOnce),
            PublishRequest::new("bad/#", "b", QoS::AtLeastOnce),
            PublishRequest::new("good/2", "c", QoS::AtMostOnce),
        ])
        .await;

    assert!(results["good/1"].is_ok());
    assert!(results["good/2"].is_ok());
    assert!(matches!(results["bad/#"], Err(PublishError::InvalidTopic { .. })));
    manager.disconnect().await;
}

#[tokio::test]
async fn test_stream_failure_is_isolated_to_its_topic() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();
    manager.publish("healthy", "0", QoS::AtLeastOnce).await.unwrap();
    harness.broker.fail_topic("broken");

    let err = manager
        .publish("broken", "x", QoS::AtLeastOnce)
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::StreamFailed { ref topic, .. } if topic == "broken"));
    assert_eq!(manager.state(), ConnectionState::Connected(TransportType::Quic));
    manager.publish("healthy", "1", QoS::AtLeastOnce).await.unwrap();

    // the next publish opens a fresh stream for the topic
    harness.broker.clear_failures();
    manager.publish("broken", "y", QoS::AtLeastOnce).await.unwrap();
    assert_eq!(harness.broker.payloads_for("broken").len(), 1);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_invalid_topics_are_rejected_before_sending() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();

    for topic in ["", "a/+/b", "a/#"] {
        let err = manager
            .publish(topic, "x", QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidTopic { .. }), "{topic:?}");
    }
    assert!(harness.broker.published().is_empty());
    manager.disconnect().await;
}

#[tokio::test]
async fn test_stalled_topic_stream_is_bounded_by_the_deadline() {
    // Arrange: the broker stops reading one topic's stream
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();
    harness.broker.stall_topic("sensors/stuck");
    let err = manager
        .publish("sensors/stuck", "first", QoS::AtLeastOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::OperationTimeout { .. }));

    // Act: a payload bigger than the stream can buffer
    let started = Instant::now();
    let err = manager
        .publish("sensors/stuck", vec![0u8; 200 * 1024], QoS::AtLeastOnce)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    // Assert: gives up at the operation timeout, other topics unaffected
    assert!(matches!(err, PublishError::OperationTimeout { ref topic, .. } if topic == "sensors/stuck"));
    assert!(elapsed < Duration::from_millis(1_500), "took {elapsed:?}");
    assert_eq!(manager.state(), ConnectionState::Connected(TransportType::Quic));
    manager.publish("sensors/ok", "x", QoS::AtLeastOnce).await.unwrap();

    let disconnect = tokio::time::timeout(Duration::from_secs(2), manager.disconnect()).await;
    assert!(disconnect.is_ok());
}

#[tokio::test]
async fn test_stalled_tcp_stream_times_out_qos0_and_drops_connection() {
    let harness = Harness::new();
    let manager = connected_tcp(&harness).await;
    harness.broker.stall_topic("bulk");
    manager.publish("bulk", "head", QoS::AtMostOnce).await.unwrap();

    let started = Instant::now();
    let err = manager
        .publish("bulk", vec![0u8; 200 * 1024], QoS::AtMostOnce)
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::WriteTimeout { ref topic, .. } if topic == "bulk"));
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_millis(1_500));
    // half a frame on the only stream: the session is rebuilt
    assert!(
        test_helpers::eventually(Duration::from_secs(3), || manager.stats().reconnect_count == 1)
            .await
    );
    manager.disconnect().await;
}
