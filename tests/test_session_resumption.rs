//! 0-RTT resumption from the persisted session ticket


use mqtt_quic_client::testing::MockQuicConnector;
use mqtt_quic_client::{ConnectionState, QoS, SessionTicket, SessionTicketStore, TransportType};
use std::time::Duration;
use test_helpers::Harness;

fn harness_with_rtt(rtt: Duration) -> Harness {
    let harness = Harness::new();
    let quic = MockQuicConnector::new(harness.broker.clone()).with_rtt(rtt);
    harness.with_quic(quic)
}

#[tokio::test]
async fn test_cold_start_saves_ticket() {
    let harness = Harness::new();
    assert!(!harness.ticket_path().exists());
    let manager = harness.manager();

    manager.connect().await.unwrap();

    let stats = manager.stats();
    assert!(!stats.zero_rtt_used);
    assert!(!stats.session_resumed);
    assert_eq!(harness.quic.zero_rtt_attempts(), 0);

    let stored = SessionTicketStore::new(harness.ticket_path()).load().unwrap();
    assert_eq!(stored.server_name, "localhost");
    assert!(!stored.ticket.is_empty());
    manager.disconnect().await;
}

#[tokio::test]
async fn test_warm_start_uses_zero_rtt() {
    // Arrange: a first connection leaves a ticket behind
    let harness = harness_with_rtt(Duration::from_millis(50));
    let manager = harness.manager();
    manager.connect().await.unwrap();
    let cold = manager.stats();
    manager.disconnect().await;

    // Act: a fresh manager, as after a process restart
    let manager = harness.manager();
    manager.connect().await.unwrap();
    let warm = manager.stats();

    // Assert
    assert_eq!(warm.transport, Some(TransportType::Quic));
    assert!(warm.zero_rtt_used);
    assert!(warm.session_resumed);
    assert_eq!(warm.zero_rtt_rejections, 0);
    assert_eq!(harness.quic.zero_rtt_attempts(), 1);
    assert!(
        warm.handshake_latency.unwrap_or_default() < cold.handshake_latency.unwrap_or_default(),
        "resumed handshake ({:?}) should beat the full one ({:?})",
        warm.handshake_latency,
        cold.handshake_latency
    );

    // the early CONNECT really reached the broker and the session works
    assert_eq!(harness.broker.connect_count(), 2);
    manager
        .publish("sensors/warm", "1", QoS::AtLeastOnce)
        .await
        .unwrap();
    manager.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_in_same_manager_resumes() {
    let harness = Harness::new();
    let manager = harness.manager();

    manager.connect().await.unwrap();
    manager.disconnect().await;
    manager.connect().await.unwrap();

    assert!(manager.stats().zero_rtt_used);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_rejected_zero_rtt_still_connects_and_replaces_ticket() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();
    manager.disconnect().await;
    let first_ticket = SessionTicketStore::new(harness.ticket_path()).load().unwrap();

    harness.quic.set_accept_0rtt(false);
    manager.connect().await.unwrap();

    let stats = manager.stats();
    assert_eq!(manager.state(), ConnectionState::Connected(TransportType::Quic));
    assert!(!stats.zero_rtt_used);
    assert!(!stats.session_resumed);
    assert_eq!(stats.zero_rtt_rejections, 1);
    assert_eq!(harness.tcp.connect_count(), 0);

    let second_ticket = SessionTicketStore::new(harness.ticket_path()).load().unwrap();
    assert_ne!(first_ticket.ticket, second_ticket.ticket);

    manager
        .publish("sensors/after-reject", "ok", QoS::AtLeastOnce)
        .await
        .unwrap();
    manager.disconnect().await;
}

#[tokio::test]
async fn test_rejected_ticket_is_cleared_when_no_new_one_arrives() {
    let harness = Harness::new();
    let manager = harness.manager();
    manager.connect().await.unwrap();
    manager.disconnect().await;
    assert!(harness.ticket_path().exists());

    harness.quic.set_accept_0rtt(false);
    harness.quic.set_issue_tickets(false);
    manager.connect().await.unwrap();

    assert!(!harness.ticket_path().exists());
    manager.disconnect().await;
}

#[tokio::test]
async fn test_corrupt_ticket_falls_back_to_full_handshake() {
    let harness = Harness::new();
    std::fs::write(harness.ticket_path(), b"{ this is not json").unwrap();
    let manager = harness.manager();

    manager.connect().await.unwrap();

    assert!(!manager.stats().zero_rtt_used);
    assert_eq!(harness.quic.zero_rtt_attempts(), 0);
    // overwritten with a usable ticket
    assert!(SessionTicketStore::new(harness.ticket_path()).load().is_some());
    manager.disconnect().await;
}

#[tokio::test]
async fn test_ticket_for_another_server_is_ignored() {
    let harness = Harness::new();
    let store = SessionTicketStore::new(harness.ticket_path());
    store
        .save(&SessionTicket::new(
            vec![7; 16],
            "other.example.com",
            Duration::from_secs(3600),
        ))
        .unwrap();
    let manager = harness.manager();

    manager.connect().await.unwrap();

    assert!(!manager.stats().zero_rtt_used);
    assert_eq!(harness.quic.zero_rtt_attempts(), 0);
    assert_eq!(store.load().unwrap().server_name, "localhost");
    manager.disconnect().await;
}

#[tokio::test]
async fn test_zero_rtt_disabled_never_presents_ticket() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.session.enable_0rtt = false;
    let manager = harness.manager_with(config);

    manager.connect().await.unwrap();
    manager.disconnect().await;
    manager.connect().await.unwrap();

    assert!(!manager.stats().zero_rtt_used);
    assert_eq!(harness.quic.zero_rtt_attempts(), 0);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_unknown_ticket_is_a_full_handshake() {
    // A ticket the server does not recognise, e.g. after a broker restart
    let harness = Harness::new();
    SessionTicketStore::new(harness.ticket_path())
        .save(&SessionTicket::new(vec![1; 16], "localhost", Duration::from_secs(3600)))
        .unwrap();
    let manager = harness.manager();

    manager.connect().await.unwrap();

    assert!(!manager.stats().zero_rtt_used);
    assert_eq!(manager.stats().zero_rtt_rejections, 0);
    manager.disconnect().await;
}
