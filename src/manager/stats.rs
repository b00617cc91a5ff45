//! Connection statistics
//!
//! Atomic counters written by the manager and the active transport, read
//! without locks into a serializable snapshot.

use super::state::ConnectionState;
use crate::transport::TransportType;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

const QUIC: u8 = 1;
const TCP_TLS: u8 = 2;

/// Facts about a freshly established connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectInfo {
    pub transport: TransportType,
    /// From the start of the attempt until CONNACK
    pub connect_latency: Duration,
    /// Transport handshake only (QUIC or TCP connect + TLS)
    pub handshake_latency: Duration,
    pub zero_rtt_used: bool,
    pub session_resumed: bool,
}

/// Thread-safe statistics recorder
#[derive(Debug, Default)]
pub struct StatsRecorder {
    /// Zero until the first connection
    transport: AtomicU8,
    connect_latency_us: AtomicU64,
    handshake_latency_us: AtomicU64,
    zero_rtt_used: AtomicBool,
    session_resumed: AtomicBool,
    reconnect_count: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    publish_failures: AtomicU64,
    operation_timeouts: AtomicU64,
    quic_connections: AtomicU64,
    tcp_connections: AtomicU64,
    zero_rtt_rejections: AtomicU64,
    open_topic_streams: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connected(&self, info: ConnectInfo) {
        let (code, counter) = match info.transport {
            TransportType::Quic => (QUIC, &self.quic_connections),
            TransportType::TcpTls => (TCP_TLS, &self.tcp_connections),
        };
        self.transport.store(code, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
        self.connect_latency_us
            .store(duration_us(info.connect_latency), Ordering::Relaxed);
        self.handshake_latency_us
            .store(duration_us(info.handshake_latency), Ordering::Relaxed);
        self.zero_rtt_used
            .store(info.zero_rtt_used, Ordering::Relaxed);
        self.session_resumed
            .store(info.session_resumed, Ordering::Relaxed);
        self.open_topic_streams.store(0, Ordering::Relaxed);
        self.touch();
    }

    /// The transport is kept as the last known one; `state` says whether it is live
    pub fn record_disconnected(&self) {
        self.open_topic_streams.store(0, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation_timeout(&self) {
        self.operation_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zero_rtt_rejected(&self) {
        self.zero_rtt_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_open_topic_streams(&self, count: usize) {
        self.open_topic_streams
            .store(count as u64, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Transport of the most recent connection, `None` before the first one
    pub fn transport(&self) -> Option<TransportType> {
        match self.transport.load(Ordering::Relaxed) {
            QUIC => Some(TransportType::Quic),
            TCP_TLS => Some(TransportType::TcpTls),
            _ => None,
        }
    }

    pub fn snapshot(&self, state: ConnectionState) -> ConnectionStatsSnapshot {
        let last_activity = match self.last_activity_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        };

        ConnectionStatsSnapshot {
            transport: self.transport(),
            state,
            connect_latency: latency(&self.connect_latency_us),
            handshake_latency: latency(&self.handshake_latency_us),
            zero_rtt_used: self.zero_rtt_used.load(Ordering::Relaxed),
            session_resumed: self.session_resumed.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            operation_timeouts: self.operation_timeouts.load(Ordering::Relaxed),
            quic_connections: self.quic_connections.load(Ordering::Relaxed),
            tcp_connections: self.tcp_connections.load(Ordering::Relaxed),
            zero_rtt_rejections: self.zero_rtt_rejections.load(Ordering::Relaxed),
            open_topic_streams: self.open_topic_streams.load(Ordering::Relaxed),
            last_activity,
        }
    }
}

fn duration_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn latency(value: &AtomicU64) -> Option<Duration> {
    match value.load(Ordering::Relaxed) {
        0 => None,
        us => Some(Duration::from_micros(us)),
    }
}

/// Point-in-time copy of the statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatsSnapshot {
    /// Last known transport, kept while reconnecting or failed
    pub transport: Option<TransportType>,
    pub state: ConnectionState,
    #[serde(rename = "connect_latency_ms", serialize_with = "as_millis")]
    pub connect_latency: Option<Duration>,
    #[serde(rename = "handshake_latency_ms", serialize_with = "as_millis")]
    pub handshake_latency: Option<Duration>,
    pub zero_rtt_used: bool,
    pub session_resumed: bool,
    pub reconnect_count: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub publish_failures: u64,
    pub operation_timeouts: u64,
    pub quic_connections: u64,
    pub tcp_connections: u64,
    pub zero_rtt_rejections: u64,
    pub open_topic_streams: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

fn as_millis<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&(duration.as_secs_f64() * 1000.0)),
        None => serializer.serialize_none(),
    }
}
