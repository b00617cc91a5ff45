//! Connection manager
//!
//! Owns the configuration, picks a transport for every connect attempt (QUIC
//! first, then TCP+TLS), persists session tickets and supervises the live
//! connection, reconnecting with backoff when it drops.

pub mod backoff;
pub mod state;
pub mod stats;

pub use state::{ConnectionEvent, ConnectionState, ConnectionStateMachine, ReconnectionDecision};
pub use stats::{ConnectInfo, ConnectionStatsSnapshot, StatsRecorder};

use crate::config::{ConfigError, ConnectionConfig, Credentials};
use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::protocol::{validate_publish_topic, validate_subscribe_filter, QoS};
use crate::publish_span;
use crate::session::SessionTicketStore;
use crate::transport::{
    ActiveTransport, ConnectContext, ConnectOutcome, IncomingMessage, MqttTransport,
    PublishRequest, QuicConnector, QuicTransport, QuinnConnector, RustlsTcpConnector,
    TcpConnector, TcpTlsTransport,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Buffered broker PUBLISH packets awaiting the application
const INCOMING_CHANNEL_CAPACITY: usize = 1024;

struct ManagerInner {
    config: Arc<ConnectionConfig>,
    quic: Arc<dyn QuicConnector>,
    tcp: Arc<dyn TcpConnector>,
    tickets: SessionTicketStore,
    stats: Arc<StatsRecorder>,
    state_tx: watch::Sender<ConnectionState>,
    active: RwLock<Option<ActiveTransport>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    /// Serializes connect attempts between the application and the supervisor
    connect_lock: tokio::sync::Mutex<()>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// MQTT connection to one broker for one device
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Manager using quinn for QUIC and tokio-rustls for the fallback
    pub fn new(config: ConnectionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let quic = Arc::new(QuinnConnector::new(config.clone())?);
        let tcp = Arc::new(RustlsTcpConnector::new(config.clone())?);
        Ok(Self::build(config, quic, tcp))
    }

    /// Manager with caller-supplied connectors
    pub fn with_connectors(
        config: ConnectionConfig,
        quic: Arc<dyn QuicConnector>,
        tcp: Arc<dyn TcpConnector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(Arc::new(config), quic, tcp))
    }

    fn build(
        config: Arc<ConnectionConfig>,
        quic: Arc<dyn QuicConnector>,
        tcp: Arc<dyn TcpConnector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(ManagerInner {
                tickets: SessionTicketStore::new(config.ticket_path()),
                config,
                quic,
                tcp,
                stats: Arc::new(StatsRecorder::new()),
                state_tx,
                active: RwLock::new(None),
                subscriptions: Mutex::new(Vec::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                incoming_tx,
                incoming_rx: Mutex::new(Some(incoming_rx)),
                supervisor: Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    /// Connect to the broker, QUIC first and TCP+TLS second.
    ///
    /// Returns once connected or once both transports have failed. Calling it
    /// while connected does nothing. A broker rejection is returned as is and
    /// never retried.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;

        if inner.is_connected() {
            debug!("connect() while already connected");
            return Ok(());
        }

        inner.stop_supervisor();
        inner.shutdown_tx.send_replace(false);

        let credentials = inner
            .config
            .credentials()
            .map_err(|e| ConnectError::config(e.to_string()))?;

        let span = crate::connection_span!(device_id = %inner.config.device.id, reconnect = false);
        let result = inner.attempt(&credentials).instrument(span).await;

        if *inner.shutdown_tx.borrow() {
            if let Ok(outcome) = result {
                outcome.transport.abort("disconnect requested during connect");
            }
            return Err(ConnectError::Aborted);
        }

        match result {
            Ok(outcome) => {
                let transport = inner.install(outcome).await;
                inner.spawn_supervisor(transport, credentials);
                Ok(())
            }
            Err(e) => {
                let event = if e.is_broker_rejection() {
                    ConnectionEvent::BrokerRejected(e.to_string())
                } else {
                    ConnectionEvent::AllTransportsFailed(e.to_string())
                };
                inner.transition(event);
                Err(e)
            }
        }
    }

    /// Publish one message. QoS 0 returns once written; QoS 1 waits for PUBACK.
    pub async fn publish<P: Into<Bytes>>(
        &self,
        topic: &str,
        payload: P,
        qos: QoS,
    ) -> Result<(), PublishError> {
        validate_publish_topic(topic).map_err(|reason| PublishError::invalid_topic(topic, reason))?;
        let transport = self.inner.require_transport().map_err(|state| {
            PublishError::NotConnected {
                state: state.to_string(),
            }
        })?;

        let span = publish_span!(topic, qos = qos.as_u8(), transport = %transport.transport_type());
        let result = transport.publish(topic, payload.into(), qos).instrument(span).await;
        if let Err(e) = &result {
            self.inner.stats.record_publish_failure();
            debug!(topic, error = %e, "Publish failed");
        }
        result
    }

    /// Publish several messages at once and collect one result per topic.
    ///
    /// Over QUIC every topic is dispatched concurrently on its own stream.
    /// Over TCP+TLS they go out in list order. A failure never stops the rest.
    /// When a topic appears more than once, any failure for it is reported.
    pub async fn publish_parallel(
        &self,
        requests: Vec<PublishRequest>,
    ) -> HashMap<String, Result<(), PublishError>> {
        let mut results: HashMap<String, Result<(), PublishError>> = HashMap::new();
        let mut valid = Vec::with_capacity(requests.len());
        for request in requests {
            match validate_publish_topic(&request.topic) {
                Ok(()) => valid.push(request),
                Err(reason) => {
                    let err = PublishError::invalid_topic(request.topic.clone(), reason);
                    merge_result(&mut results, request.topic, Err(err));
                }
            }
        }

        let transport = match self.inner.require_transport() {
            Ok(transport) => transport,
            Err(state) => {
                for request in valid {
                    let err = PublishError::NotConnected {
                        state: state.to_string(),
                    };
                    merge_result(&mut results, request.topic, Err(err));
                }
                return results;
            }
        };

        let count = valid.len();
        let span = publish_span!(batch = count, transport = %transport.transport_type());
        let outcomes = transport.publish_batch(valid).instrument(span).await;
        for (topic, result) in outcomes {
            if result.is_err() {
                self.inner.stats.record_publish_failure();
            }
            merge_result(&mut results, topic, result);
        }
        results
    }

    /// Subscribe to `filter`. The subscription is replayed after every reconnect.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), SubscribeError> {
        validate_subscribe_filter(filter)
            .map_err(|reason| SubscribeError::invalid_filter(filter, reason))?;
        let transport = self.inner.require_transport().map_err(|state| {
            SubscribeError::NotConnected {
                state: state.to_string(),
            }
        })?;

        let granted = transport.subscribe(filter, qos).await?;
        info!(filter, requested = ?qos, granted = ?granted, "Subscribed");
        self.inner.remember_subscription(filter, qos);
        Ok(())
    }

    /// Send DISCONNECT if connected and tear everything down. Always succeeds.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.shutdown_tx.send_replace(true);
        inner.stop_supervisor();

        let transport = inner
            .active
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(transport) = transport {
            info!(transport = %transport.transport_type(), "Disconnecting from broker");
            transport.disconnect().await;
        }
        inner.stats.record_disconnected();
        inner.transition(ConnectionEvent::DisconnectRequested);
    }

    /// Point-in-time statistics; never blocks
    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.inner.stats.snapshot(self.state())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Messages the broker publishes to our subscriptions. Available once.
    pub fn take_message_receiver(&self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.inner
            .incoming_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
        self.inner.stop_supervisor();
        if let Some(transport) = self
            .inner
            .active
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            transport.abort("connection manager dropped");
        }
        // No DISCONNECT from Drop; call disconnect() for a clean goodbye
    }
}

fn merge_result(
    results: &mut HashMap<String, Result<(), PublishError>>,
    topic: String,
    result: Result<(), PublishError>,
) {
    match results.get(&topic) {
        Some(Err(_)) => {}
        _ => {
            results.insert(topic, result);
        }
    }
}

impl ManagerInner {
    fn is_connected(&self) -> bool {
        ConnectionStateMachine::can_operate(&self.state_tx.borrow()).is_some()
            && self
                .current_transport()
                .is_some_and(|transport| !transport.is_closed())
    }

    fn current_transport(&self) -> Option<ActiveTransport> {
        self.active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The live transport, or the current state explaining why there is none
    fn require_transport(&self) -> Result<ActiveTransport, ConnectionState> {
        let state = *self.state_tx.borrow();
        ConnectionStateMachine::can_operate(&state)
            .and_then(|_| self.current_transport())
            .ok_or(state)
    }

    fn transition(&self, event: ConnectionEvent) -> ConnectionState {
        let mut from = ConnectionState::Disconnected;
        let mut to = ConnectionState::Disconnected;
        self.state_tx.send_modify(|state| {
            from = *state;
            *state = ConnectionStateMachine::next_state(*state, &event);
            to = *state;
        });
        if from != to {
            ConnectionStateMachine::log_state_transition(&from, &to, &event);
        }
        to
    }

    fn context(&self, credentials: &Credentials) -> ConnectContext {
        ConnectContext {
            config: self.config.clone(),
            credentials: credentials.clone(),
            stats: self.stats.clone(),
            incoming: self.incoming_tx.clone(),
        }
    }

    /// The ticket to present, if one is stored for this server
    fn load_ticket(&self) -> Option<crate::session::SessionTicket> {
        if !self.config.session.enable_0rtt {
            return None;
        }
        let ticket = self.tickets.load()?;
        if ticket.server_name != self.config.server_name() {
            debug!(
                stored = %ticket.server_name,
                expected = %self.config.server_name(),
                "Session ticket issued for another server, ignoring"
            );
            return None;
        }
        Some(ticket)
    }

    /// One attempt: QUIC, then TCP+TLS unless the broker itself refused us
    async fn attempt(&self, credentials: &Credentials) -> Result<ConnectOutcome, ConnectError> {
        self.transition(ConnectionEvent::AttemptStarted);
        let ctx = self.context(credentials);
        let ticket = self.load_ticket();

        let quic_error = match QuicTransport::connect(&*self.quic, ticket.as_ref(), &ctx).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_broker_rejection() => return Err(e),
            Err(e) => e,
        };
        self.transition(ConnectionEvent::PrimaryFailed(quic_error.to_string()));

        match TcpTlsTransport::connect(&*self.tcp, &ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_broker_rejection() => Err(e),
            Err(tcp_error) => Err(ConnectError::AllTransportsFailed {
                quic: Box::new(quic_error),
                tcp: Box::new(tcp_error),
            }),
        }
    }

    /// Persist or drop the ticket according to what the handshake reported
    fn update_ticket(&self, outcome: &ConnectOutcome) {
        if outcome.zero_rtt_rejected {
            if let Err(e) = self.tickets.clear() {
                warn!(error = %e, "Failed to remove rejected session ticket");
            }
        }
        if let Some(ticket) = &outcome.new_ticket {
            if let Err(e) = self.tickets.save(ticket) {
                warn!(error = %e, path = %self.tickets.path().display(), "Failed to save session ticket");
            }
        }
    }

    async fn install(&self, outcome: ConnectOutcome) -> ActiveTransport {
        self.update_ticket(&outcome);
        let transport = outcome.transport;
        self.stats.record_connected(outcome.info);
        *self.active.write().unwrap_or_else(|p| p.into_inner()) = Some(transport.clone());

        self.resubscribe(&transport).await;
        self.transition(ConnectionEvent::Established(transport.transport_type()));
        transport
    }

    fn remember_subscription(&self, filter: &str, qos: QoS) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        match subscriptions.iter_mut().find(|(f, _)| f == filter) {
            Some(entry) => entry.1 = qos,
            None => subscriptions.push((filter.to_string(), qos)),
        }
    }

    async fn resubscribe(&self, transport: &ActiveTransport) {
        let subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for (filter, qos) in subscriptions {
            match transport.subscribe(&filter, qos).await {
                Ok(_) => debug!(filter = %filter, "Re-subscribed"),
                Err(e) => error!(filter = %filter, error = %e, "Failed to re-subscribe"),
            }
        }
    }

    fn clear_active(&self) {
        self.active.write().unwrap_or_else(|p| p.into_inner()).take();
        self.stats.record_disconnected();
    }

    fn stop_supervisor(&self) {
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, transport: ActiveTransport, credentials: Credentials) {
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.supervise(transport, credentials).await });
        if let Some(previous) = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
    }

    /// Wait for the live connection to drop, then reconnect; repeat
    async fn supervise(self: Arc<Self>, mut transport: ActiveTransport, credentials: Credentials) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let cause = tokio::select! {
                cause = transport.closed() => cause,
                _ = async { shutdown_rx.wait_for(|stop| *stop).await.map(|_| ()) } => return,
            };
            if *shutdown_rx.borrow() {
                return;
            }

            warn!(transport = %transport.transport_type(), %cause, "Connection lost");
            transport.abort("connection lost");
            self.clear_active();

            match self.reconnect(&credentials, &mut shutdown_rx).await {
                Some(next) => transport = next,
                None => return,
            }
        }
    }

    async fn reconnect(
        &self,
        credentials: &Credentials,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<ActiveTransport> {
        let mut failed_attempts = 0u32;
        loop {
            let decision = {
                let mut rng = rand::thread_rng();
                ConnectionStateMachine::should_attempt_reconnection(
                    failed_attempts,
                    &self.config.reconnect,
                    *shutdown_rx.borrow(),
                    &mut rng,
                )
            };

            match decision {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    self.transition(ConnectionEvent::ReconnectScheduled(attempt));
                    let max_display = self
                        .config
                        .reconnect
                        .max_attempts
                        .map_or("∞".to_string(), |max| max.to_string());
                    info!(
                        "Attempting reconnection {}/{} after {}ms delay",
                        attempt,
                        max_display,
                        delay.as_millis()
                    );

                    if !interruptible_sleep(shutdown_rx.clone(), delay).await {
                        return None;
                    }

                    let _guard = self.connect_lock.lock().await;
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, aborting reconnection");
                        return None;
                    }

                    let span = crate::connection_span!(device_id = %self.config.device.id, reconnect = true, attempt);
                    match self.attempt(credentials).instrument(span).await {
                        Ok(outcome) => {
                            self.stats.record_reconnect();
                            return Some(self.install(outcome).await);
                        }
                        Err(e) if e.is_broker_rejection() => {
                            self.transition(ConnectionEvent::BrokerRejected(e.to_string()));
                            return None;
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "Reconnection attempt failed");
                            failed_attempts = attempt;
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown signal received, stopping reconnection");
                    return None;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    self.transition(ConnectionEvent::RetriesExhausted(failed_attempts));
                    return None;
                }
            }
        }
    }
}

/// Sleep unless shutdown is signalled first.
/// Returns true if the sleep completed, false if shutdown was requested.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow_and_update() {
        return false;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // sender gone, nothing can interrupt us any more
                    (&mut sleep).await;
                    return true;
                }
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
            }
            _ = &mut sleep => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        // Arrange: Create shutdown channel
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // Act: Sleep without interruption
        let result = interruptible_sleep(shutdown_rx, Duration::from_millis(10)).await;

        // Assert: Should complete normally
        assert!(result, "Sleep should complete without interruption");
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        // Arrange: Create shutdown channel and signal shutdown
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        // Act: Sleep with interruption
        let result = interruptible_sleep(shutdown_rx, Duration::from_secs(10)).await;

        // Assert: Should be interrupted
        assert!(!result, "Sleep should be interrupted by shutdown signal");
    }

    #[tokio::test]
    async fn test_interruptible_sleep_returns_early_when_already_stopped() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        let started = tokio::time::Instant::now();

        assert!(!interruptible_sleep(shutdown_rx, Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_does_not_block_shutdown_sender() {
        // Arrange: a sleeper parked on the channel
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sleeper = tokio::spawn(interruptible_sleep(shutdown_rx, Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Act: signal from another task
        let sent = tokio::time::timeout(Duration::from_secs(1), async move {
            shutdown_tx.send_replace(true);
            shutdown_tx
        })
        .await;

        // Assert
        assert!(sent.is_ok());
        let completed = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
    }

    #[test]
    fn test_supervisor_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let sleep = interruptible_sleep(shutdown_rx, Duration::ZERO);
        assert_send(&sleep);
    }

    #[test]
    fn test_merge_result_keeps_first_failure() {
        let mut results = HashMap::new();
        merge_result(&mut results, "a".to_string(), Ok(()));
        merge_result(&mut results, "a".to_string(), Err(PublishError::ConnectionLost));
        merge_result(&mut results, "a".to_string(), Ok(()));
        assert_eq!(results["a"], Err(PublishError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_operations_fail_before_connect() {
        let manager = ConnectionManager::new(ConnectionConfig::new("localhost", "dev-1")).unwrap();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
        assert!(matches!(
            manager.publish("a/b", "x", QoS::AtLeastOnce).await,
            Err(PublishError::NotConnected { .. })
        ));
        assert!(matches!(
            manager.subscribe("a/#", QoS::AtLeastOnce).await,
            Err(SubscribeError::NotConnected { .. })
        ));

        let results = manager
            .publish_parallel(vec![
                PublishRequest::new("a", "1", QoS::AtMostOnce),
                PublishRequest::new("bad/+", "2", QoS::AtMostOnce),
            ])
            .await;
        assert!(matches!(results["a"], Err(PublishError::NotConnected { .. })));
        assert!(matches!(results["bad/+"], Err(PublishError::InvalidTopic { .. })));

        // disconnect without a connection still succeeds
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.take_message_receiver().is_some());
        assert!(manager.take_message_receiver().is_none());
    }
}
