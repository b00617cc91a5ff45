//! MQTT 3.1.1 control packet model
//!
//! Only the packets this client needs are modelled: the connect handshake,
//! QoS 0/1 publish, subscribe, ping and disconnect.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-header type nibbles (already shifted into the high nibble)
pub mod packet_type {
    pub const CONNECT: u8 = 0x10;
    pub const CONNACK: u8 = 0x20;
    pub const PUBLISH: u8 = 0x30;
    pub const PUBACK: u8 = 0x40;
    pub const SUBSCRIBE: u8 = 0x80;
    pub const SUBACK: u8 = 0x90;
    pub const PINGREQ: u8 = 0xC0;
    pub const PINGRESP: u8 = 0xD0;
    pub const DISCONNECT: u8 = 0xE0;
}

/// Protocol level byte for MQTT 3.1.1
pub const PROTOCOL_LEVEL: u8 = 0x04;
/// Protocol name carried in CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";

/// Delivery guarantee. QoS 2 is intentionally absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum QoS {
    #[serde(rename = "0")]
    AtMostOnce,
    #[default]
    #[serde(rename = "1")]
    AtLeastOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }

    /// Returns `None` for QoS 2 and for reserved values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// CONNACK return codes (MQTT 3.1.1 section 3.2.2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectReturnCode {
    Accepted,
    BadProtocolVersion,
    IdentifierRejected,
    BrokerUnavailable,
    BadCredentials,
    NotAuthorized,
    Unknown(u8),
}

impl ConnectReturnCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => Self::Accepted,
            1 => Self::BadProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::BrokerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::BadProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::BrokerUnavailable => 3,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
            Self::Unknown(code) => code,
        }
    }

    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "connection accepted"),
            Self::BadProtocolVersion => write!(f, "unacceptable protocol version"),
            Self::IdentifierRejected => write!(f, "client identifier rejected"),
            Self::BrokerUnavailable => write!(f, "broker unavailable"),
            Self::BadCredentials => write!(f, "bad user name or password"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::Unknown(code) => write!(f, "unknown return code {code}"),
        }
    }
}

/// Per-filter SUBACK result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Granted(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Granted(QoS::AtMostOnce)),
            0x01 => Some(Self::Granted(QoS::AtLeastOnce)),
            // QoS 2 grants are downgraded: this client never asks for them
            0x02 => Some(Self::Granted(QoS::AtLeastOnce)),
            0x80 => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Granted(qos) => qos.as_u8(),
            Self::Failure => 0x80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present iff `qos` is `AtLeastOnce`
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retain: false,
            dup: false,
            packet_id: None,
            payload: payload.into(),
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// A decoded MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connack_code_mapping() {
        assert_eq!(ConnectReturnCode::from_u8(0), ConnectReturnCode::Accepted);
        assert_eq!(ConnectReturnCode::from_u8(4), ConnectReturnCode::BadCredentials);
        assert_eq!(ConnectReturnCode::from_u8(5), ConnectReturnCode::NotAuthorized);
        assert_eq!(ConnectReturnCode::from_u8(42), ConnectReturnCode::Unknown(42));
        for code in 0..=255u8 {
            assert_eq!(ConnectReturnCode::from_u8(code).as_u8(), code);
        }
    }

    #[test]
    fn test_qos_from_u8_rejects_qos2() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::from_u8(2), None);
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn test_suback_codes() {
        assert_eq!(
            SubscribeReturnCode::from_u8(0x01),
            Some(SubscribeReturnCode::Granted(QoS::AtLeastOnce))
        );
        assert_eq!(SubscribeReturnCode::from_u8(0x80), Some(SubscribeReturnCode::Failure));
        assert_eq!(SubscribeReturnCode::from_u8(0x03), None);
    }

    #[test]
    fn test_qos_serde_uses_numeric_strings() {
        #[derive(Deserialize)]
        struct Wrapper {
            qos: QoS,
        }
        let parsed: Wrapper = toml::from_str("qos = \"0\"").unwrap();
        assert_eq!(parsed.qos, QoS::AtMostOnce);
    }
}
