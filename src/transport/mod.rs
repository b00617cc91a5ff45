//! Transport layer
//!
//! Two ways of carrying MQTT to the broker behind one capability trait:
//! QUIC with a control stream plus per-topic streams, and a single
//! TLS-over-TCP stream. The manager holds whichever is live as an
//! [`ActiveTransport`].

use crate::config::{ConnectionConfig, Credentials};
use crate::error::{PublishError, SubscribeError, TransportError};
use crate::manager::stats::{ConnectInfo, StatsRecorder};
use crate::protocol::QoS;
use crate::session::SessionTicket;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod link;
pub mod pending;
pub mod quic;
pub(crate) mod shared;
pub mod tcp_tls;
pub mod tls;

pub use quic::{QuicConnector, QuicHandshake, QuicLink, QuicTransport, QuinnConnector};
pub use tcp_tls::{RustlsTcpConnector, TcpConnector, TcpHandshake, TcpTlsTransport};

/// Which transport carries the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Quic,
    TcpTls,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Quic => write!(f, "QUIC"),
            TransportType::TcpTls => write!(f, "TCP+TLS"),
        }
    }
}

/// A PUBLISH received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

/// One entry of a parallel publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl PublishRequest {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }
}

/// Everything a transport needs from the manager to open a session
#[derive(Clone)]
pub struct ConnectContext {
    pub config: Arc<ConnectionConfig>,
    pub credentials: Credentials,
    pub stats: Arc<StatsRecorder>,
    pub incoming: mpsc::Sender<IncomingMessage>,
}

/// Result of a successful transport connect
pub struct ConnectOutcome {
    pub transport: ActiveTransport,
    pub info: ConnectInfo,
    /// CONNACK session-present flag
    pub session_present: bool,
    /// A ticket was presented but the server refused early data
    pub zero_rtt_rejected: bool,
    /// Ticket issued during this handshake, for the manager to persist
    pub new_ticket: Option<SessionTicket>,
}

/// Operations every connected transport supports
#[async_trait]
pub trait MqttTransport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// QoS 0 returns once written; QoS 1 waits for PUBACK or the operation timeout
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError>;

    /// Publish several messages, returning one result per request in request order
    async fn publish_batch(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Vec<(String, Result<(), PublishError>)>;

    /// Subscribe and return the granted QoS
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, SubscribeError>;

    /// Send DISCONNECT and close the connection
    async fn disconnect(&self);

    /// Tear down without the MQTT goodbye
    fn abort(&self, reason: &str);

    /// Resolves once the connection is lost, with the cause
    async fn closed(&self) -> TransportError;

    fn is_closed(&self) -> bool;
}

/// The live transport. A closed set, dispatched by match.
#[derive(Clone)]
pub enum ActiveTransport {
    Quic(QuicTransport),
    TcpTls(TcpTlsTransport),
}

#[async_trait]
impl MqttTransport for ActiveTransport {
    fn transport_type(&self) -> TransportType {
        match self {
            ActiveTransport::Quic(_) => TransportType::Quic,
            ActiveTransport::TcpTls(_) => TransportType::TcpTls,
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        match self {
            ActiveTransport::Quic(t) => t.publish(topic, payload, qos).await,
            ActiveTransport::TcpTls(t) => t.publish(topic, payload, qos).await,
        }
    }

    async fn publish_batch(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Vec<(String, Result<(), PublishError>)> {
        match self {
            ActiveTransport::Quic(t) => t.publish_batch(requests).await,
            ActiveTransport::TcpTls(t) => t.publish_batch(requests).await,
        }
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, SubscribeError> {
        match self {
            ActiveTransport::Quic(t) => t.subscribe(filter, qos).await,
            ActiveTransport::TcpTls(t) => t.subscribe(filter, qos).await,
        }
    }

    async fn disconnect(&self) {
        match self {
            ActiveTransport::Quic(t) => t.disconnect().await,
            ActiveTransport::TcpTls(t) => t.disconnect().await,
        }
    }

    fn abort(&self, reason: &str) {
        match self {
            ActiveTransport::Quic(t) => t.abort(reason),
            ActiveTransport::TcpTls(t) => t.abort(reason),
        }
    }

    async fn closed(&self) -> TransportError {
        match self {
            ActiveTransport::Quic(t) => t.closed().await,
            ActiveTransport::TcpTls(t) => t.closed().await,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            ActiveTransport::Quic(t) => t.is_closed(),
            ActiveTransport::TcpTls(t) => t.is_closed(),
        }
    }
}
