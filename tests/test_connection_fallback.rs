//! Transport selection: QUIC first, TCP+TLS when QUIC cannot be established,
//! and no fallback at all when the broker itself refuses us.


use mqtt_quic_client::testing::Reachability;
use mqtt_quic_client::{ConnectError, ConnectReturnCode, ConnectionState, QoS, TransportType};
use std::time::{Duration, Instant};
use test_helpers::Harness;

#[tokio::test]
async fn test_connects_over_quic_when_available() {
    let harness = Harness::new();
    let manager = harness.manager();

    manager.connect().await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected(TransportType::Quic));
    let stats = manager.stats();
    assert_eq!(stats.transport, Some(TransportType::Quic));
    assert_eq!(stats.quic_connections, 1);
    assert_eq!(stats.tcp_connections, 0);
    assert!(stats.connect_latency.is_some());
    assert_eq!(harness.tcp.connect_count(), 0);

    let connects = harness.broker.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].client_id, "test-device");
    assert_eq!(connects[0].username.as_deref(), Some("test-device"));
    assert_eq!(connects[0].transport, TransportType::Quic);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_falls_back_to_tcp_when_udp_is_blackholed() {
    let harness = Harness::new();
    harness.quic.set_reachability(Reachability::Blackholed);
    let manager = harness.manager();

    let started = Instant::now();
    manager.connect().await.unwrap();

    // QUIC is given up on at the connect timeout, not before
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(manager.state(), ConnectionState::Connected(TransportType::TcpTls));
    let stats = manager.stats();
    assert_eq!(stats.transport, Some(TransportType::TcpTls));
    assert!(!stats.zero_rtt_used);
    assert_eq!(stats.reconnect_count, 0);
    assert_eq!(harness.tcp.connect_count(), 1);

    manager
        .publish("sensors/fallback", "21.5", QoS::AtLeastOnce)
        .await
        .unwrap();
    let published = harness.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].transport, TransportType::TcpTls);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_falls_back_immediately_when_quic_is_refused() {
    let harness = Harness::new();
    harness.quic.set_reachability(Reachability::Refused);
    let manager = harness.manager();

    let started = Instant::now();
    manager.connect().await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(manager.stats().transport, Some(TransportType::TcpTls));
    manager.disconnect().await;
}

#[tokio::test]
async fn test_both_transports_down_fails() {
    let harness = Harness::new();
    harness.quic.set_reachability(Reachability::Refused);
    harness.tcp.set_reachability(Reachability::Refused);
    let manager = harness.manager();

    let err = manager.connect().await.unwrap_err();

    match err {
        ConnectError::AllTransportsFailed { quic, tcp } => {
            assert!(quic.to_string().contains("unreachable"));
            assert!(tcp.to_string().contains("unreachable"));
        }
        other => panic!("expected AllTransportsFailed, got {other:?}"),
    }
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert!(!manager.is_connected());
    assert_eq!(manager.stats().transport, None);
}

#[tokio::test]
async fn test_broker_rejection_is_not_retried_or_fallen_back_from() {
    let harness = Harness::new();
    harness.broker.set_connack(ConnectReturnCode::BadCredentials);
    let manager = harness.manager();

    let err = manager.connect().await.unwrap_err();

    assert_eq!(err, ConnectError::BrokerRejection(ConnectReturnCode::BadCredentials));
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert_eq!(harness.tcp.connect_count(), 0);

    // no reconnect loop starts behind our back
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.broker.connect_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_connect_again_after_failure_succeeds() {
    let harness = Harness::new();
    harness.broker.set_connack(ConnectReturnCode::NotAuthorized);
    let manager = harness.manager();
    assert!(manager.connect().await.is_err());

    harness.broker.set_connack(ConnectReturnCode::Accepted);
    manager.connect().await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected(TransportType::Quic));
    manager.disconnect().await;
}

#[tokio::test]
async fn test_connect_is_idempotent_while_connected() {
    let harness = Harness::new();
    let manager = harness.manager();

    manager.connect().await.unwrap();
    manager.connect().await.unwrap();

    assert_eq!(harness.broker.connect_count(), 1);
    assert_eq!(harness.quic.connect_count(), 1);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_sends_disconnect_and_resets_state() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();

    manager.disconnect().await;

    assert!(
        test_helpers::eventually(Duration::from_secs(1), || harness.broker.disconnect_count() == 1)
            .await
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    // last known transport stays visible
    assert_eq!(manager.stats().transport, Some(TransportType::Quic));
    assert!(matches!(
        manager.publish("a/b", "x", QoS::AtMostOnce).await,
        Err(mqtt_quic_client::PublishError::NotConnected { .. })
    ));

    // a second disconnect is harmless
    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_password_is_read_from_environment() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.auth.username = Some("fleet".to_string());
    config.auth.password_env = Some("MQTT_QUIC_TEST_PASSWORD".to_string());
    std::env::set_var("MQTT_QUIC_TEST_PASSWORD", "s3cret");
    let manager = harness.manager_with(config);

    manager.connect().await.unwrap();

    let connect = &harness.broker.connects()[0];
    assert_eq!(connect.username.as_deref(), Some("fleet"));
    assert_eq!(connect.password.as_deref(), Some(&b"s3cret"[..]));
    manager.disconnect().await;
}

#[tokio::test]
async fn test_missing_password_variable_is_a_config_error() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.auth.password_env = Some("MQTT_QUIC_TEST_UNSET_PASSWORD".to_string());
    let manager = harness.manager_with(config);

    let err = manager.connect().await.unwrap_err();

    assert!(matches!(err, ConnectError::Config(_)));
    assert_eq!(harness.quic.connect_count(), 0);
}
