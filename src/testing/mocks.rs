//! In-process broker and connectors for testing
//!
//! `MockBroker` speaks MQTT 3.1.1 over in-memory duplex pipes. The mock
//! connectors hand the client one end of a pipe per stream and give the broker
//! the other, so the real transports, codec and manager run unchanged.

use crate::error::TransportError;
use crate::protocol::{
    ConnAck, ConnectReturnCode, MqttFramer, Packet, Publish, QoS, SubAck, SubscribeReturnCode,
};
use crate::session::SessionTicket;
use crate::transport::link::{BoxedReader, BoxedWriter, FrameReader, FrameWriter};
use crate::transport::{
    QuicConnector, QuicHandshake, QuicLink, TcpConnector, TcpHandshake, TransportType,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A PUBLISH the broker received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Broker-side stream number; each pipe gets a fresh one
    pub stream: u64,
    pub transport: TransportType,
}

/// A CONNECT the broker received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRecord {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub transport: TransportType,
}

struct BrokerInner {
    connack_code: Mutex<ConnectReturnCode>,
    ack_publishes: AtomicBool,
    ack_delay: Mutex<Duration>,
    respond_to_ping: AtomicBool,
    fail_topics: Mutex<HashSet<String>>,
    stall_topics: Mutex<HashSet<String>>,
    garble_topics: Mutex<HashSet<String>>,
    published: Mutex<Vec<ReceivedPublish>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    connects: Mutex<Vec<ConnectRecord>>,
    controls: Mutex<Vec<mpsc::UnboundedSender<Packet>>>,
    generation: watch::Sender<u64>,
    next_stream: AtomicU64,
    next_packet_id: AtomicU16,
    pings: AtomicU64,
    disconnects: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Scriptable MQTT broker
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                connack_code: Mutex::new(ConnectReturnCode::Accepted),
                ack_publishes: AtomicBool::new(true),
                ack_delay: Mutex::new(Duration::ZERO),
                respond_to_ping: AtomicBool::new(true),
                fail_topics: Mutex::new(HashSet::new()),
                stall_topics: Mutex::new(HashSet::new()),
                garble_topics: Mutex::new(HashSet::new()),
                published: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                connects: Mutex::new(Vec::new()),
                controls: Mutex::new(Vec::new()),
                generation,
                next_stream: AtomicU64::new(1),
                next_packet_id: AtomicU16::new(1),
                pings: AtomicU64::new(0),
                disconnects: AtomicU64::new(0),
            }),
        }
    }

    /// CONNACK code for subsequent CONNECTs
    pub fn set_connack(&self, code: ConnectReturnCode) {
        *lock(&self.inner.connack_code) = code;
    }

    /// Stop (or resume) answering QoS 1 publishes
    pub fn set_ack_publishes(&self, ack: bool) {
        self.inner.ack_publishes.store(ack, Ordering::SeqCst);
    }

    /// Delay before each PUBACK, per stream
    pub fn set_ack_delay(&self, delay: Duration) {
        *lock(&self.inner.ack_delay) = delay;
    }

    pub fn set_respond_to_ping(&self, respond: bool) {
        self.inner.respond_to_ping.store(respond, Ordering::SeqCst);
    }

    /// Reset the stream carrying the next PUBLISH to `topic` instead of acking it
    pub fn fail_topic<T: Into<String>>(&self, topic: T) {
        lock(&self.inner.fail_topics).insert(topic.into());
    }

    /// Stop reading the stream carrying the next PUBLISH to `topic` while
    /// keeping it open, so the client's later writes back up
    pub fn stall_topic<T: Into<String>>(&self, topic: T) {
        lock(&self.inner.stall_topics).insert(topic.into());
    }

    /// Answer the next PUBLISH to `topic` with bytes that are not MQTT
    pub fn garble_topic<T: Into<String>>(&self, topic: T) {
        lock(&self.inner.garble_topics).insert(topic.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.inner.fail_topics).clear();
        lock(&self.inner.stall_topics).clear();
        lock(&self.inner.garble_topics).clear();
    }

    /// Drop every open connection, as if the broker restarted
    pub fn drop_connections(&self) {
        lock(&self.inner.controls).clear();
        self.inner.generation.send_modify(|g| *g += 1);
    }

    /// Send a PUBLISH to every connected client
    pub fn deliver<T: Into<String>, P: Into<Bytes>>(&self, topic: T, payload: P, qos: QoS) -> usize {
        let mut publish = Publish::new(topic, payload, qos);
        if qos == QoS::AtLeastOnce {
            let id = self.inner.next_packet_id.fetch_add(1, Ordering::SeqCst).max(1);
            publish = publish.with_packet_id(id);
        }
        let mut controls = lock(&self.inner.controls);
        controls.retain(|tx| !tx.is_closed());
        controls
            .iter()
            .filter(|tx| tx.send(Packet::Publish(publish.clone())).is_ok())
            .count()
    }

    pub fn published(&self) -> Vec<ReceivedPublish> {
        lock(&self.inner.published).clone()
    }

    /// Payloads received for `topic`, in arrival order
    pub fn payloads_for(&self, topic: &str) -> Vec<Bytes> {
        lock(&self.inner.published)
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.inner.subscriptions).clone()
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        lock(&self.inner.connects).clone()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.inner.connects).len()
    }

    pub fn ping_count(&self) -> u64 {
        self.inner.pings.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> u64 {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// Serve the broker end of one stream until it closes, the connection goes
    /// away or the broker drops connections
    pub fn spawn_stream(
        &self,
        server: DuplexStream,
        transport: TransportType,
        link_closed: Option<watch::Receiver<Option<String>>>,
    ) -> u64 {
        let stream = self.inner.next_stream.fetch_add(1, Ordering::SeqCst);
        let generation = *self.inner.generation.borrow();
        let broker = self.clone();
        tokio::spawn(async move {
            broker
                .serve_stream(server, stream, generation, transport, link_closed)
                .await;
        });
        stream
    }

    async fn serve_stream(
        self,
        server: DuplexStream,
        stream: u64,
        generation: u64,
        transport: TransportType,
        mut link_closed: Option<watch::Receiver<Option<String>>>,
    ) {
        let mut generation_rx = self.inner.generation.subscribe();
        let (read, write) = tokio::io::split(server);
        let framer = MqttFramer::default();
        let mut reader = FrameReader::new(Box::new(read), framer);
        let writer = FrameWriter::new(Box::new(write));
        let (deliver_tx, mut deliver_rx) = mpsc::unbounded_channel();

        loop {
            // bytes already written win over a close that raced them
            let packet = tokio::select! {
                biased;
                packet = reader.next_packet() => match packet {
                    Ok(packet) => packet,
                    Err(_) => return,
                },
                _ = async { generation_rx.wait_for(|g| *g != generation).await.map(|_| ()) } => return,
                _ = wait_link_closed(&mut link_closed) => return,
                Some(outgoing) = deliver_rx.recv() => {
                    if send(&writer, framer, &outgoing).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            let reply = match packet {
                Packet::Connect(connect) => {
                    lock(&self.inner.connects).push(ConnectRecord {
                        client_id: connect.client_id,
                        username: connect.username,
                        password: connect.password,
                        clean_session: connect.clean_session,
                        keep_alive: connect.keep_alive,
                        transport,
                    });
                    let code = *lock(&self.inner.connack_code);
                    let ack = Packet::ConnAck(ConnAck {
                        session_present: false,
                        code,
                    });
                    if send(&writer, framer, &ack).await.is_err() || !code.is_accepted() {
                        return;
                    }
                    lock(&self.inner.controls).push(deliver_tx.clone());
                    None
                }
                Packet::Publish(publish) => {
                    if lock(&self.inner.fail_topics).contains(&publish.topic) {
                        // dropping both halves resets this stream only
                        return;
                    }
                    let stall = lock(&self.inner.stall_topics).contains(&publish.topic);
                    let garble = lock(&self.inner.garble_topics).contains(&publish.topic);
                    lock(&self.inner.published).push(ReceivedPublish {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: publish.qos,
                        stream,
                        transport,
                    });
                    if stall {
                        tokio::select! {
                            _ = async { generation_rx.wait_for(|g| *g != generation).await.map(|_| ()) } => {}
                            _ = wait_link_closed(&mut link_closed) => {}
                        }
                        return;
                    }
                    if garble {
                        // packet type 0 is reserved
                        if writer.write_frame(&Bytes::from_static(&[0x00, 0x00])).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    match publish.packet_id {
                        Some(packet_id) if self.inner.ack_publishes.load(Ordering::SeqCst) => {
                            let delay = *lock(&self.inner.ack_delay);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            Some(Packet::PubAck { packet_id })
                        }
                        _ => None,
                    }
                }
                Packet::Subscribe(subscribe) => {
                    let mut return_codes = Vec::with_capacity(subscribe.filters.len());
                    {
                        let mut subscriptions = lock(&self.inner.subscriptions);
                        for (filter, qos) in subscribe.filters {
                            subscriptions.push((filter, qos));
                            return_codes.push(SubscribeReturnCode::Granted(qos));
                        }
                    }
                    Some(Packet::SubAck(SubAck {
                        packet_id: subscribe.packet_id,
                        return_codes,
                    }))
                }
                Packet::PingReq => {
                    self.inner.pings.fetch_add(1, Ordering::SeqCst);
                    if self.inner.respond_to_ping.load(Ordering::SeqCst) {
                        Some(Packet::PingResp)
                    } else {
                        None
                    }
                }
                Packet::Disconnect => {
                    self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                _ => None,
            };

            if let Some(reply) = reply {
                if send(&writer, framer, &reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn send(writer: &FrameWriter, framer: MqttFramer, packet: &Packet) -> Result<(), TransportError> {
    let frame = framer
        .encode_to_bytes(packet)
        .map_err(|e| TransportError::Stream(e.to_string()))?;
    writer.write_frame(&frame).await
}

async fn wait_link_closed(link_closed: &mut Option<watch::Receiver<Option<String>>>) {
    match link_closed {
        Some(rx) => {
            let _ = rx.wait_for(|reason| reason.is_some()).await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// How a mock endpoint responds to connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    /// Fails immediately
    Refused,
    /// Never answers, like a firewall dropping packets
    Blackholed,
}

struct QuicConnectorState {
    reachability: Mutex<Reachability>,
    accept_0rtt: AtomicBool,
    issue_tickets: AtomicBool,
    known_tickets: Mutex<HashSet<Vec<u8>>>,
    connects: AtomicU64,
    zero_rtt_attempts: AtomicU64,
}

/// QUIC connector backed by `MockBroker`.
///
/// A full handshake costs one `rtt`; a resumed one with early data costs
/// nothing up front and confirms acceptance one `rtt` later. Tickets issued
/// here are the only ones it will resume.
#[derive(Clone)]
pub struct MockQuicConnector {
    broker: MockBroker,
    server_name: String,
    rtt: Duration,
    state: Arc<QuicConnectorState>,
}

impl MockQuicConnector {
    pub fn new(broker: MockBroker) -> Self {
        Self {
            broker,
            server_name: "localhost".to_string(),
            rtt: Duration::from_millis(20),
            state: Arc::new(QuicConnectorState {
                reachability: Mutex::new(Reachability::Reachable),
                accept_0rtt: AtomicBool::new(true),
                issue_tickets: AtomicBool::new(true),
                known_tickets: Mutex::new(HashSet::new()),
                connects: AtomicU64::new(0),
                zero_rtt_attempts: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.rtt = rtt;
        self
    }

    pub fn with_server_name<S: Into<String>>(mut self, server_name: S) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn set_reachability(&self, reachability: Reachability) {
        *lock(&self.state.reachability) = reachability;
    }

    pub fn set_accept_0rtt(&self, accept: bool) {
        self.state.accept_0rtt.store(accept, Ordering::SeqCst);
    }

    pub fn set_issue_tickets(&self, issue: bool) {
        self.state.issue_tickets.store(issue, Ordering::SeqCst);
    }

    /// Completed handshakes
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn zero_rtt_attempts(&self) -> u64 {
        self.state.zero_rtt_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuicConnector for MockQuicConnector {
    async fn connect(&self, ticket: Option<&SessionTicket>) -> Result<QuicHandshake, TransportError> {
        let reachability = *lock(&self.state.reachability);
        match reachability {
            Reachability::Refused => {
                return Err(TransportError::unreachable(
                    format!("{}:14567", self.server_name),
                    "ICMP port unreachable",
                ))
            }
            Reachability::Blackholed => return futures::future::pending().await,
            Reachability::Reachable => {}
        }

        let started = Instant::now();
        let resumable = ticket.is_some_and(|t| lock(&self.state.known_tickets).contains(&t.ticket));
        if resumable {
            self.state.zero_rtt_attempts.fetch_add(1, Ordering::SeqCst);
        } else {
            tokio::time::sleep(self.rtt).await;
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let issued = if self.state.issue_tickets.load(Ordering::SeqCst) {
            let bytes = uuid::Uuid::new_v4().as_bytes().to_vec();
            lock(&self.state.known_tickets).insert(bytes.clone());
            Some(SessionTicket::new(
                bytes,
                self.server_name.clone(),
                Duration::from_secs(3600),
            ))
        } else {
            None
        };

        let (closed, _) = watch::channel(None);
        let link = MockQuicLink {
            broker: self.broker.clone(),
            generation: *self.broker.inner.generation.borrow(),
            handshake_done: Instant::now() + if resumable { self.rtt } else { Duration::ZERO },
            early: resumable,
            early_accepted: resumable && self.state.accept_0rtt.load(Ordering::SeqCst),
            issued,
            closed,
        };

        Ok(QuicHandshake {
            link: Arc::new(link),
            zero_rtt_attempted: resumable,
            handshake_latency: started.elapsed(),
        })
    }
}

struct MockQuicLink {
    broker: MockBroker,
    generation: u64,
    handshake_done: Instant,
    early: bool,
    early_accepted: bool,
    issued: Option<SessionTicket>,
    closed: watch::Sender<Option<String>>,
}

impl MockQuicLink {
    fn dropped_by_broker(&self) -> bool {
        *self.broker.inner.generation.borrow() != self.generation
    }
}

#[async_trait]
impl QuicLink for MockQuicLink {
    async fn open_bi(&self) -> Result<(BoxedWriter, BoxedReader), TransportError> {
        if let Some(reason) = self.close_reason() {
            return Err(TransportError::closed(reason));
        }
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let rejected_early = self.early && !self.early_accepted && Instant::now() < self.handshake_done;
        if rejected_early {
            // the server discards streams sent as refused early data
            drop(server);
        } else {
            self.broker
                .spawn_stream(server, TransportType::Quic, Some(self.closed.subscribe()));
        }
        let (read, write) = tokio::io::split(client);
        Ok((Box::new(write), Box::new(read)))
    }

    async fn zero_rtt_accepted(&self) -> bool {
        if !self.early {
            return false;
        }
        tokio::time::sleep_until(self.handshake_done).await;
        self.early_accepted
    }

    fn issued_ticket(&self) -> Option<SessionTicket> {
        self.issued.clone()
    }

    async fn closed(&self) -> TransportError {
        let mut closed_rx = self.closed.subscribe();
        let mut generation_rx = self.broker.inner.generation.subscribe();
        let generation = self.generation;
        tokio::select! {
            reason = async { closed_rx.wait_for(|r| r.is_some()).await.ok().and_then(|r| r.clone()) } => {
                TransportError::closed(reason.unwrap_or_default())
            }
            _ = async { generation_rx.wait_for(|g| *g != generation).await.map(|_| ()) } => {
                TransportError::closed("connection dropped by broker")
            }
        }
    }

    fn close_reason(&self) -> Option<String> {
        if let Some(reason) = self.closed.borrow().clone() {
            return Some(reason);
        }
        self.dropped_by_broker()
            .then(|| "connection dropped by broker".to_string())
    }

    fn close(&self, reason: &str) {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        });
    }
}

/// TCP+TLS connector backed by `MockBroker`. Connect plus TLS costs two `rtt`.
#[derive(Clone)]
pub struct MockTcpConnector {
    broker: MockBroker,
    rtt: Duration,
    reachability: Arc<Mutex<Reachability>>,
    connects: Arc<AtomicU64>,
}

impl MockTcpConnector {
    pub fn new(broker: MockBroker) -> Self {
        Self {
            broker,
            rtt: Duration::from_millis(20),
            reachability: Arc::new(Mutex::new(Reachability::Reachable)),
            connects: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.rtt = rtt;
        self
    }

    pub fn set_reachability(&self, reachability: Reachability) {
        *lock(&self.reachability) = reachability;
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TcpConnector for MockTcpConnector {
    async fn connect(&self) -> Result<TcpHandshake, TransportError> {
        let reachability = *lock(&self.reachability);
        match reachability {
            Reachability::Refused => {
                return Err(TransportError::unreachable("localhost:8883", "connection refused"))
            }
            Reachability::Blackholed => return futures::future::pending().await,
            Reachability::Reachable => {}
        }

        let started = Instant::now();
        tokio::time::sleep(self.rtt * 2).await;
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.broker.spawn_stream(server, TransportType::TcpTls, None);
        let (read, write) = tokio::io::split(client);
        Ok(TcpHandshake {
            writer: Box::new(write),
            reader: Box::new(read),
            handshake_latency: started.elapsed(),
        })
    }
}
