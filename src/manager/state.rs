//! Pure connection state transitions and reconnection decisions
//!
//! Nothing in here touches the network. The manager feeds events in and
//! publishes whatever state comes out on its watch channel.

use super::backoff;
use crate::config::ReconnectSection;
use crate::transport::TransportType;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Connection lifecycle. Exactly one is live per `ConnectionManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Never connected, or `disconnect()` was called
    Disconnected,
    /// Trying QUIC
    ConnectingPrimary,
    /// QUIC failed on this attempt, trying TCP+TLS
    ConnectingFallback,
    Connected(TransportType),
    /// Waiting out the backoff before reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
    /// Terminal until the application calls `connect()` again
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::ConnectingPrimary => write!(f, "connecting (QUIC)"),
            ConnectionState::ConnectingFallback => write!(f, "connecting (TCP+TLS fallback)"),
            ConnectionState::Connected(transport) => write!(f, "connected over {transport}"),
            ConnectionState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An attempt begins; QUIC goes first
    AttemptStarted,
    /// QUIC failed at transport level
    PrimaryFailed(String),
    /// Handshake and CONNACK succeeded
    Established(TransportType),
    /// Both transports failed on the initial attempt
    AllTransportsFailed(String),
    /// The broker answered CONNECT with a non-accepted code
    BrokerRejected(String),
    /// Backoff for the given attempt has started
    ReconnectScheduled(u32),
    /// Reconnect attempts exhausted
    RetriesExhausted(u32),
    /// Application called `disconnect()`
    DisconnectRequested,
}

/// Pure state machine helpers
pub struct ConnectionStateMachine;

impl ConnectionStateMachine {
    /// Determine next state after a connection event (pure function)
    pub fn next_state(current: ConnectionState, event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::AttemptStarted => ConnectionState::ConnectingPrimary,
            ConnectionEvent::PrimaryFailed(_) => match current {
                ConnectionState::ConnectingPrimary => ConnectionState::ConnectingFallback,
                other => other,
            },
            ConnectionEvent::Established(transport) => ConnectionState::Connected(*transport),
            ConnectionEvent::AllTransportsFailed(_)
            | ConnectionEvent::BrokerRejected(_)
            | ConnectionEvent::RetriesExhausted(_) => ConnectionState::Failed,
            ConnectionEvent::ReconnectScheduled(attempt) => ConnectionState::Reconnecting {
                attempt: *attempt,
            },
            ConnectionEvent::DisconnectRequested => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows publishing and subscribing (pure function)
    pub fn can_operate(state: &ConnectionState) -> Option<TransportType> {
        match state {
            ConnectionState::Connected(transport) => Some(*transport),
            _ => None,
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(
        from: &ConnectionState,
        to: &ConnectionState,
        event: &ConnectionEvent,
    ) {
        match (from, to, event) {
            (_, ConnectionState::Connected(transport), _) => {
                info!(%transport, "MQTT connection established");
            }
            (_, ConnectionState::ConnectingFallback, ConnectionEvent::PrimaryFailed(reason)) => {
                warn!(%reason, "QUIC unavailable, falling back to TCP+TLS");
            }
            (_, ConnectionState::Reconnecting { attempt }, _) => {
                info!(attempt, "Scheduling reconnection");
            }
            (_, ConnectionState::Failed, ConnectionEvent::BrokerRejected(reason)) => {
                error!(%reason, "Broker rejected connection, not retrying");
            }
            (_, ConnectionState::Failed, _) => {
                error!(?event, "Connection failed");
            }
            _ => {
                info!("Connection state: {} -> {}", from, to);
            }
        }
    }

    /// Determine if reconnection should be attempted (pure function apart from jitter)
    pub fn should_attempt_reconnection<R: Rng>(
        failed_attempts: u32,
        config: &ReconnectSection,
        shutdown_requested: bool,
        rng: &mut R,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: failed_attempts + 1,
            delay: backoff::jittered_delay(config, failed_attempts, rng),
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Sleep `delay`, then run attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_happy_path_over_quic() {
        let state = ConnectionState::Disconnected;
        let state = ConnectionStateMachine::next_state(state, &ConnectionEvent::AttemptStarted);
        assert_eq!(state, ConnectionState::ConnectingPrimary);

        let state = ConnectionStateMachine::next_state(
            state,
            &ConnectionEvent::Established(TransportType::Quic),
        );
        assert_eq!(state, ConnectionState::Connected(TransportType::Quic));
    }

    #[test]
    fn test_fallback_path() {
        let state = ConnectionStateMachine::next_state(
            ConnectionState::ConnectingPrimary,
            &ConnectionEvent::PrimaryFailed("timeout".to_string()),
        );
        assert_eq!(state, ConnectionState::ConnectingFallback);

        let failed = ConnectionStateMachine::next_state(
            state,
            &ConnectionEvent::AllTransportsFailed("refused".to_string()),
        );
        assert_eq!(failed, ConnectionState::Failed);

        let connected = ConnectionStateMachine::next_state(
            state,
            &ConnectionEvent::Established(TransportType::TcpTls),
        );
        assert_eq!(connected, ConnectionState::Connected(TransportType::TcpTls));
    }

    #[test]
    fn test_primary_failure_outside_primary_is_ignored() {
        let state = ConnectionStateMachine::next_state(
            ConnectionState::Disconnected,
            &ConnectionEvent::PrimaryFailed("late".to_string()),
        );
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_from_any_state() {
        for state in [
            ConnectionState::ConnectingPrimary,
            ConnectionState::ConnectingFallback,
            ConnectionState::Connected(TransportType::Quic),
            ConnectionState::Reconnecting { attempt: 3 },
            ConnectionState::Failed,
        ] {
            assert_eq!(
                ConnectionStateMachine::next_state(state, &ConnectionEvent::DisconnectRequested),
                ConnectionState::Disconnected
            );
        }
    }

    #[test]
    fn test_can_operate_only_when_connected() {
        assert_eq!(
            ConnectionStateMachine::can_operate(&ConnectionState::Connected(TransportType::TcpTls)),
            Some(TransportType::TcpTls)
        );
        assert_eq!(
            ConnectionStateMachine::can_operate(&ConnectionState::Reconnecting { attempt: 1 }),
            None
        );
    }

    #[test]
    fn test_reconnection_decisions() {
        let mut rng = StepRng::new(u64::MAX / 2, 0);
        let config = ReconnectSection {
            max_attempts: Some(3),
            jitter: 0.0,
            ..ReconnectSection::default()
        };

        assert_eq!(
            ConnectionStateMachine::should_attempt_reconnection(0, &config, true, &mut rng),
            ReconnectionDecision::AbortShutdownRequested
        );
        assert_eq!(
            ConnectionStateMachine::should_attempt_reconnection(0, &config, false, &mut rng),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_millis(1_000)
            }
        );
        assert_eq!(
            ConnectionStateMachine::should_attempt_reconnection(2, &config, false, &mut rng),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay: Duration::from_millis(4_000)
            }
        );
        assert_eq!(
            ConnectionStateMachine::should_attempt_reconnection(3, &config, false, &mut rng),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_unlimited_attempts_never_abort() {
        let mut rng = StepRng::new(0, 1);
        let config = ReconnectSection::default();
        assert!(matches!(
            ConnectionStateMachine::should_attempt_reconnection(10_000, &config, false, &mut rng),
            ReconnectionDecision::Proceed { attempt: 10_001, .. }
        ));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            ConnectionState::Connected(TransportType::Quic).to_string(),
            "connected over QUIC"
        );
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting (attempt 2)"
        );
    }
}
