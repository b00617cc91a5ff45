//! Error types for the MQTT-over-QUIC client
//!
//! Errors are split by the layer that raises them. `TransportError` and
//! `ProtocolError` come from the wire, the operation errors
//! (`ConnectError`, `PublishError`, `SubscribeError`) are what callers of
//! `ConnectionManager` see, and `StorageError` never escapes the session
//! ticket store's callers.

use crate::protocol::ConnectReturnCode;
use std::time::Duration;
use thiserror::Error;

/// Failures below MQTT: sockets, QUIC, TLS
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("{addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn unreachable<A: Into<String>, R: ToString>(addr: A, reason: R) -> Self {
        Self::Unreachable {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn closed<S: Into<String>>(reason: S) -> Self {
        Self::Closed(reason.into())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Closed(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// MQTT framing and sequencing violations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("remaining length {0} exceeds the MQTT maximum")]
    RemainingLengthOverflow(usize),

    #[error("invalid packet type byte 0x{0:02X}")]
    InvalidPacketType(u8),

    #[error("invalid flags 0x{flags:X} for packet type 0x{packet_type:02X}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("malformed {packet}: {reason}")]
    Malformed { packet: &'static str, reason: String },

    #[error("unsupported QoS level {0}")]
    UnsupportedQos(u8),

    #[error("packet of {size} bytes exceeds limit of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("expected {expected}, received {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },
}

/// Why `connect()` failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("all transports failed (QUIC: {quic}; TCP+TLS: {tcp})")]
    AllTransportsFailed {
        quic: Box<ConnectError>,
        tcp: Box<ConnectError>,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("broker rejected connection: {0}")]
    BrokerRejection(ConnectReturnCode),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("reconnection abandoned after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("connect aborted by disconnect()")]
    Aborted,
}

impl ConnectError {
    /// A non-accepted CONNACK. Never retried, never triggers fallback.
    pub fn is_broker_rejection(&self) -> bool {
        matches!(self, Self::BrokerRejection(_))
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }
}

/// Why a publish did not complete
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("not connected (state: {state})")]
    NotConnected { state: String },

    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("no PUBACK for packet {packet_id} on '{topic}' within {timeout:?}")]
    OperationTimeout {
        packet_id: u16,
        topic: String,
        timeout: Duration,
    },

    #[error("PUBLISH on '{topic}' could not be written within {timeout:?}")]
    WriteTimeout { topic: String, timeout: Duration },

    #[error("stream for '{topic}' failed: {reason}")]
    StreamFailed { topic: String, reason: String },

    #[error("connection lost before the operation completed")]
    ConnectionLost,

    #[error("all 65535 packet identifiers are in flight")]
    PacketIdsExhausted,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl PublishError {
    /// True when resubmitting the same publish may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::OperationTimeout { .. }
                | Self::WriteTimeout { .. }
                | Self::StreamFailed { .. }
                | Self::ConnectionLost
                | Self::PacketIdsExhausted
        )
    }

    pub fn invalid_topic<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

/// Why a subscribe did not complete
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("not connected (state: {state})")]
    NotConnected { state: String },

    #[error("invalid topic filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("no SUBACK for packet {packet_id} on '{filter}' within {timeout:?}")]
    OperationTimeout {
        packet_id: u16,
        filter: String,
        timeout: Duration,
    },

    #[error("broker refused subscription to '{filter}'")]
    Rejected { filter: String },

    #[error("connection lost before the operation completed")]
    ConnectionLost,

    #[error("all 65535 packet identifiers are in flight")]
    PacketIdsExhausted,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SubscribeError {
    pub fn invalid_filter<T: Into<String>, R: Into<String>>(filter: T, reason: R) -> Self {
        Self::InvalidFilter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }
}

/// Session ticket persistence failures. Logged and otherwise ignored.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("ticket file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("ticket encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not replace ticket file: {0}")]
    Persist(#[from] tempfile::PersistError),
}
