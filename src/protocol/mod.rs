//! MQTT 3.1.1 wire protocol
//!
//! Packet model, streaming codec and topic validation shared by both
//! transports.

pub mod codec;
pub mod packet;
pub mod topic;

pub use codec::{MqttFramer, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode,
};
pub use topic::{validate_publish_topic, validate_subscribe_filter};
