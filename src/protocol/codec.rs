//! Streaming MQTT 3.1.1 encoder/decoder
//!
//! `MqttFramer::try_decode` is fed a growing buffer and either reports that
//! more bytes are needed or removes exactly one packet from the front of it.
//! Both transports feed it arbitrarily sized reads.

use super::packet::{
    packet_type, ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, PROTOCOL_LEVEL, PROTOCOL_NAME,
};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest value representable by the 4-byte remaining-length field
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default cap on a single packet (fixed header included)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Outcome of parsing the fixed header from a partial buffer
#[derive(Debug, PartialEq, Eq)]
pub enum FixedHeader {
    /// Not enough bytes to know the packet length yet
    Incomplete,
    /// `header_len` bytes of fixed header followed by `remaining_len` bytes of body
    Complete {
        first_byte: u8,
        header_len: usize,
        remaining_len: usize,
    },
}

/// Transport-agnostic MQTT framer
#[derive(Debug, Clone, Copy)]
pub struct MqttFramer {
    max_packet_size: usize,
}

impl Default for MqttFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl MqttFramer {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH + 5),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete packet; in that
    /// case `buf` is left untouched. On success the packet's bytes are consumed
    /// and any tail remains in `buf` for the next call.
    pub fn try_decode(&self, buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        let (first_byte, header_len, remaining_len) = match parse_fixed_header(buf)? {
            FixedHeader::Incomplete => return Ok(None),
            FixedHeader::Complete {
                first_byte,
                header_len,
                remaining_len,
            } => (first_byte, header_len, remaining_len),
        };

        let total = header_len + remaining_len;
        if total > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        frame.advance(header_len);
        decode_body(first_byte, frame.freeze()).map(Some)
    }

    /// Append the wire form of `packet` to `out`
    pub fn encode(&self, packet: &Packet, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        let first_byte = encode_body(packet, &mut body)?;

        let total = 1 + remaining_length_len(body.len())? + body.len();
        if total > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }

        out.reserve(total);
        out.put_u8(first_byte);
        encode_remaining_length(body.len(), out)?;
        out.extend_from_slice(&body);
        Ok(())
    }

    /// Convenience wrapper returning the encoded bytes
    pub fn encode_to_bytes(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        self.encode(packet, &mut out)?;
        Ok(out.freeze())
    }
}

/// Parse the fixed header without consuming anything
pub fn parse_fixed_header(buf: &[u8]) -> Result<FixedHeader, ProtocolError> {
    if buf.len() < 2 {
        return Ok(FixedHeader::Incomplete);
    }

    let mut value: usize = 0;
    let mut multiplier: usize = 1;
    for (index, byte) in buf[1..].iter().enumerate() {
        if index == 4 {
            return Err(ProtocolError::MalformedRemainingLength);
        }
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(FixedHeader::Complete {
                first_byte: buf[0],
                header_len: index + 2,
                remaining_len: value,
            });
        }
        multiplier *= 128;
    }

    if buf.len() - 1 >= 4 {
        // four continuation bytes seen and still no terminator
        return Err(ProtocolError::MalformedRemainingLength);
    }
    Ok(FixedHeader::Incomplete)
}

/// Base-128 continuation encoding, 1 to 4 bytes
pub fn encode_remaining_length(mut len: usize, out: &mut BytesMut) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::RemainingLengthOverflow(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn remaining_length_len(len: usize) -> Result<usize, ProtocolError> {
    match len {
        0..=127 => Ok(1),
        128..=16_383 => Ok(2),
        16_384..=2_097_151 => Ok(3),
        2_097_152..=MAX_REMAINING_LENGTH => Ok(4),
        _ => Err(ProtocolError::RemainingLengthOverflow(len)),
    }
}

fn put_string(out: &mut BytesMut, value: &str, packet: &'static str) -> Result<(), ProtocolError> {
    put_binary(out, value.as_bytes(), packet)
}

fn put_binary(out: &mut BytesMut, value: &[u8], packet: &'static str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::Malformed {
        packet,
        reason: format!("field of {} bytes exceeds 65535", value.len()),
    })?;
    out.put_u16(len);
    out.extend_from_slice(value);
    Ok(())
}

fn encode_body(packet: &Packet, body: &mut BytesMut) -> Result<u8, ProtocolError> {
    let first_byte = match packet {
        Packet::Connect(connect) => {
            put_string(body, PROTOCOL_NAME, "CONNECT")?;
            body.put_u8(PROTOCOL_LEVEL);

            let mut flags = 0u8;
            if connect.clean_session {
                flags |= 0x02;
            }
            if connect.username.is_some() {
                flags |= 0x80;
            }
            if connect.password.is_some() {
                if connect.username.is_none() {
                    return Err(ProtocolError::Malformed {
                        packet: "CONNECT",
                        reason: "password without user name".to_string(),
                    });
                }
                flags |= 0x40;
            }
            body.put_u8(flags);
            body.put_u16(connect.keep_alive);

            put_string(body, &connect.client_id, "CONNECT")?;
            if let Some(username) = &connect.username {
                put_string(body, username, "CONNECT")?;
            }
            if let Some(password) = &connect.password {
                put_binary(body, password, "CONNECT")?;
            }
            packet_type::CONNECT
        }
        Packet::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code.as_u8());
            packet_type::CONNACK
        }
        Packet::Publish(publish) => {
            put_string(body, &publish.topic, "PUBLISH")?;
            match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, None) => {}
                (QoS::AtLeastOnce, Some(packet_id)) if packet_id != 0 => body.put_u16(packet_id),
                (QoS::AtMostOnce, Some(_)) => {
                    return Err(ProtocolError::Malformed {
                        packet: "PUBLISH",
                        reason: "QoS 0 publish must not carry a packet identifier".to_string(),
                    })
                }
                (QoS::AtLeastOnce, _) => {
                    return Err(ProtocolError::Malformed {
                        packet: "PUBLISH",
                        reason: "QoS 1 publish requires a non-zero packet identifier".to_string(),
                    })
                }
            }
            body.extend_from_slice(&publish.payload);

            let mut first = packet_type::PUBLISH | (publish.qos.as_u8() << 1);
            if publish.retain {
                first |= 0x01;
            }
            if publish.dup {
                first |= 0x08;
            }
            first
        }
        Packet::PubAck { packet_id } => {
            body.put_u16(*packet_id);
            packet_type::PUBACK
        }
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(ProtocolError::Malformed {
                    packet: "SUBSCRIBE",
                    reason: "at least one topic filter is required".to_string(),
                });
            }
            body.put_u16(subscribe.packet_id);
            for (filter, qos) in &subscribe.filters {
                put_string(body, filter, "SUBSCRIBE")?;
                body.put_u8(qos.as_u8());
            }
            packet_type::SUBSCRIBE | 0x02
        }
        Packet::SubAck(ack) => {
            body.put_u16(ack.packet_id);
            for code in &ack.return_codes {
                body.put_u8(code.as_u8());
            }
            packet_type::SUBACK
        }
        Packet::PingReq => packet_type::PINGREQ,
        Packet::PingResp => packet_type::PINGRESP,
        Packet::Disconnect => packet_type::DISCONNECT,
    };
    Ok(first_byte)
}

fn malformed(packet: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        packet,
        reason: reason.into(),
    }
}

fn get_u8(body: &mut Bytes, packet: &'static str) -> Result<u8, ProtocolError> {
    if body.remaining() < 1 {
        return Err(malformed(packet, "truncated"));
    }
    Ok(body.get_u8())
}

fn get_u16(body: &mut Bytes, packet: &'static str) -> Result<u16, ProtocolError> {
    if body.remaining() < 2 {
        return Err(malformed(packet, "truncated"));
    }
    Ok(body.get_u16())
}

fn get_binary(body: &mut Bytes, packet: &'static str) -> Result<Bytes, ProtocolError> {
    let len = get_u16(body, packet)? as usize;
    if body.remaining() < len {
        return Err(malformed(packet, "length prefix exceeds packet"));
    }
    Ok(body.split_to(len))
}

fn get_string(body: &mut Bytes, packet: &'static str) -> Result<String, ProtocolError> {
    let raw = get_binary(body, packet)?;
    String::from_utf8(raw.to_vec()).map_err(|_| malformed(packet, "invalid UTF-8 string"))
}

fn expect_flags(first_byte: u8, expected: u8) -> Result<(), ProtocolError> {
    let flags = first_byte & 0x0F;
    if flags != expected {
        return Err(ProtocolError::InvalidFlags {
            packet_type: first_byte & 0xF0,
            flags,
        });
    }
    Ok(())
}

fn expect_empty(body: &Bytes, packet: &'static str) -> Result<(), ProtocolError> {
    if body.has_remaining() {
        return Err(malformed(packet, "unexpected trailing bytes"));
    }
    Ok(())
}

fn decode_body(first_byte: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    match first_byte & 0xF0 {
        packet_type::CONNECT => {
            expect_flags(first_byte, 0)?;
            let name = get_string(&mut body, "CONNECT")?;
            if name != PROTOCOL_NAME {
                return Err(malformed("CONNECT", format!("protocol name '{name}'")));
            }
            let level = get_u8(&mut body, "CONNECT")?;
            if level != PROTOCOL_LEVEL {
                return Err(malformed("CONNECT", format!("protocol level {level}")));
            }
            let flags = get_u8(&mut body, "CONNECT")?;
            if flags & 0x04 != 0 {
                return Err(malformed("CONNECT", "will messages are not supported"));
            }
            let keep_alive = get_u16(&mut body, "CONNECT")?;
            let client_id = get_string(&mut body, "CONNECT")?;
            let username = if flags & 0x80 != 0 {
                Some(get_string(&mut body, "CONNECT")?)
            } else {
                None
            };
            let password = if flags & 0x40 != 0 {
                Some(get_binary(&mut body, "CONNECT")?)
            } else {
                None
            };
            expect_empty(&body, "CONNECT")?;
            Ok(Packet::Connect(Connect {
                client_id,
                keep_alive,
                clean_session: flags & 0x02 != 0,
                username,
                password,
            }))
        }
        packet_type::CONNACK => {
            expect_flags(first_byte, 0)?;
            let ack_flags = get_u8(&mut body, "CONNACK")?;
            let code = get_u8(&mut body, "CONNACK")?;
            expect_empty(&body, "CONNACK")?;
            Ok(Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code: ConnectReturnCode::from_u8(code),
            }))
        }
        packet_type::PUBLISH => {
            let qos_bits = (first_byte & 0x06) >> 1;
            let qos = QoS::from_u8(qos_bits).ok_or(ProtocolError::UnsupportedQos(qos_bits))?;
            let topic = get_string(&mut body, "PUBLISH")?;
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => Some(get_u16(&mut body, "PUBLISH")?),
            };
            Ok(Packet::Publish(Publish {
                topic,
                qos,
                retain: first_byte & 0x01 != 0,
                dup: first_byte & 0x08 != 0,
                packet_id,
                payload: body,
            }))
        }
        packet_type::PUBACK => {
            expect_flags(first_byte, 0)?;
            let packet_id = get_u16(&mut body, "PUBACK")?;
            expect_empty(&body, "PUBACK")?;
            Ok(Packet::PubAck { packet_id })
        }
        packet_type::SUBSCRIBE => {
            expect_flags(first_byte, 0x02)?;
            let packet_id = get_u16(&mut body, "SUBSCRIBE")?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = get_string(&mut body, "SUBSCRIBE")?;
                let requested = get_u8(&mut body, "SUBSCRIBE")?;
                // QoS 2 requests are downgraded to the highest level this codec models
                let qos = QoS::from_u8(requested.min(1)).unwrap_or(QoS::AtLeastOnce);
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(malformed("SUBSCRIBE", "no topic filters"));
            }
            Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
        }
        packet_type::SUBACK => {
            expect_flags(first_byte, 0)?;
            let packet_id = get_u16(&mut body, "SUBACK")?;
            let mut return_codes = Vec::with_capacity(body.remaining());
            while body.has_remaining() {
                let code = body.get_u8();
                return_codes.push(
                    SubscribeReturnCode::from_u8(code)
                        .ok_or_else(|| malformed("SUBACK", format!("return code 0x{code:02X}")))?,
                );
            }
            Ok(Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            }))
        }
        packet_type::PINGREQ => {
            expect_flags(first_byte, 0)?;
            expect_empty(&body, "PINGREQ")?;
            Ok(Packet::PingReq)
        }
        packet_type::PINGRESP => {
            expect_flags(first_byte, 0)?;
            expect_empty(&body, "PINGRESP")?;
            Ok(Packet::PingResp)
        }
        packet_type::DISCONNECT => {
            expect_flags(first_byte, 0)?;
            expect_empty(&body, "DISCONNECT")?;
            Ok(Packet::Disconnect)
        }
        _ => Err(ProtocolError::InvalidPacketType(first_byte)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn framer() -> MqttFramer {
        MqttFramer::default()
    }

    fn encode(packet: &Packet) -> BytesMut {
        let mut out = BytesMut::new();
        framer().encode(packet, &mut out).unwrap();
        out
    }

    #[test]
    fn test_remaining_length_boundaries() {
        let cases: [(usize, &[u8]); 8] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16_383, &[0xFF, 0x7F]),
            (16_384, &[0x80, 0x80, 0x01]),
            (2_097_151, &[0xFF, 0xFF, 0x7F]),
            (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];
        for (value, expected) in cases {
            let mut out = BytesMut::new();
            encode_remaining_length(value, &mut out).unwrap();
            assert_eq!(&out[..], expected, "encoding of {value}");

            let mut header = vec![0x30];
            header.extend_from_slice(expected);
            assert_eq!(
                parse_fixed_header(&header).unwrap(),
                FixedHeader::Complete {
                    first_byte: 0x30,
                    header_len: 1 + expected.len(),
                    remaining_len: value
                }
            );
        }
    }

    #[test]
    fn test_remaining_length_overflow_rejected() {
        let mut out = BytesMut::new();
        assert_eq!(
            encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut out),
            Err(ProtocolError::RemainingLengthOverflow(MAX_REMAINING_LENGTH + 1))
        );
        assert_eq!(
            parse_fixed_header(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(ProtocolError::MalformedRemainingLength)
        );
    }

    #[test]
    fn test_incomplete_header_needs_more_bytes() {
        assert_eq!(parse_fixed_header(&[]).unwrap(), FixedHeader::Incomplete);
        assert_eq!(parse_fixed_header(&[0x30]).unwrap(), FixedHeader::Incomplete);
        assert_eq!(
            parse_fixed_header(&[0x30, 0x80, 0x80]).unwrap(),
            FixedHeader::Incomplete
        );
    }

    #[test]
    fn test_connect_wire_format_matches_mqtt_311() {
        let packet = Packet::Connect(Connect {
            client_id: "dev".to_string(),
            keep_alive: 60,
            clean_session: true,
            username: Some("u".to_string()),
            password: Some(Bytes::from_static(b"p")),
        });
        let bytes = encode(&packet);
        let expected: &[u8] = &[
            0x10, 0x15, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0xC2, 0x00, 0x3C, // variable header
            0x00, 0x03, b'd', b'e', b'v', 0x00, 0x01, b'u', 0x00, 0x01, b'p',
        ];
        assert_eq!(&bytes[..], expected);
    }

    #[test]
    fn test_fixed_header_type_bytes() {
        assert_eq!(encode(&Packet::PingReq)[..], [0xC0, 0x00]);
        assert_eq!(encode(&Packet::PingResp)[..], [0xD0, 0x00]);
        assert_eq!(encode(&Packet::Disconnect)[..], [0xE0, 0x00]);
        assert_eq!(encode(&Packet::PubAck { packet_id: 7 })[..], [0x40, 0x02, 0x00, 0x07]);

        let subscribe = encode(&Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![("a".to_string(), QoS::AtLeastOnce)],
        }));
        assert_eq!(subscribe[0], 0x82);

        let publish = encode(&Packet::Publish(
            Publish::new("t", Bytes::from_static(b"x"), QoS::AtLeastOnce).with_packet_id(9),
        ));
        assert_eq!(publish[0], 0x32);
    }

    #[test]
    fn test_publish_retain_and_dup_bits() {
        let mut publish = Publish::new("t", Bytes::new(), QoS::AtMostOnce);
        publish.retain = true;
        publish.dup = true;
        let bytes = encode(&Packet::Publish(publish.clone()));
        assert_eq!(bytes[0], 0x39);

        let mut buf = bytes;
        assert_eq!(
            framer().try_decode(&mut buf).unwrap(),
            Some(Packet::Publish(publish))
        );
    }

    #[test]
    fn test_qos1_publish_requires_packet_id() {
        let publish = Publish::new("t", Bytes::new(), QoS::AtLeastOnce);
        let mut out = BytesMut::new();
        assert!(framer()
            .encode(&Packet::Publish(publish), &mut out)
            .is_err());
    }

    #[test]
    fn test_decode_leaves_tail_in_buffer() {
        let mut buf = encode(&Packet::PubAck { packet_id: 1 });
        buf.extend_from_slice(&encode(&Packet::PingResp));
        buf.extend_from_slice(&[0x20]); // start of a CONNACK

        assert_eq!(
            framer().try_decode(&mut buf).unwrap(),
            Some(Packet::PubAck { packet_id: 1 })
        );
        assert_eq!(framer().try_decode(&mut buf).unwrap(), Some(Packet::PingResp));
        assert_eq!(framer().try_decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], &[0x20]);

        buf.extend_from_slice(&[0x02, 0x00, 0x04]);
        assert_eq!(
            framer().try_decode(&mut buf).unwrap(),
            Some(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::BadCredentials
            }))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let packet = Packet::SubAck(SubAck {
            packet_id: 300,
            return_codes: vec![
                SubscribeReturnCode::Granted(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
            ],
        });
        let bytes = encode(&packet);
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in bytes.iter().enumerate() {
            buf.put_u8(*byte);
            let result = framer().try_decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(result.is_none(), "decoded early at byte {i}");
            } else {
                decoded = result;
            }
        }
        assert_eq!(decoded, Some(packet));
    }

    #[test]
    fn test_decode_rejects_qos2_publish() {
        let mut buf = BytesMut::from(&[0x34, 0x05, 0x00, 0x01, b't', 0x00, 0x01][..]);
        assert_eq!(
            framer().try_decode(&mut buf),
            Err(ProtocolError::UnsupportedQos(2))
        );
    }

    #[test]
    fn test_decode_rejects_reserved_type() {
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert_eq!(
            framer().try_decode(&mut buf),
            Err(ProtocolError::InvalidPacketType(0x00))
        );
    }

    #[test]
    fn test_packet_size_limit_applies_before_body_arrives() {
        let small = MqttFramer::new(16);
        // header announces 100 bytes of body
        let mut buf = BytesMut::from(&[0x30, 0x64][..]);
        assert!(matches!(
            small.try_decode(&mut buf),
            Err(ProtocolError::PacketTooLarge { size: 102, max: 16 })
        ));

        let publish = Publish::new("topic", vec![0u8; 64], QoS::AtMostOnce);
        let mut out = BytesMut::new();
        assert!(matches!(
            small.encode(&Packet::Publish(publish), &mut out),
            Err(ProtocolError::PacketTooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn remaining_length_parses_what_it_encodes(len in 0usize..=MAX_REMAINING_LENGTH) {
            let mut out = BytesMut::new();
            out.put_u8(0x30);
            encode_remaining_length(len, &mut out).unwrap();
            let header_len = out.len();
            prop_assert_eq!(
                parse_fixed_header(&out).unwrap(),
                FixedHeader::Complete { first_byte: 0x30, header_len, remaining_len: len }
            );
        }

        #[test]
        fn publish_decodes_across_arbitrary_split(
            topic in "[a-z/]{1,32}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            split in 0usize..600,
        ) {
            let packet = Packet::Publish(
                Publish::new(topic, payload, QoS::AtLeastOnce).with_packet_id(42),
            );
            let bytes = encode(&packet);
            let split = split.min(bytes.len());

            let mut buf = BytesMut::from(&bytes[..split]);
            let first = framer().try_decode(&mut buf).unwrap();
            if split < bytes.len() {
                prop_assert!(first.is_none());
                buf.extend_from_slice(&bytes[split..]);
                prop_assert_eq!(framer().try_decode(&mut buf).unwrap(), Some(packet));
            } else {
                prop_assert_eq!(first, Some(packet));
            }
            prop_assert!(buf.is_empty());
        }
    }
}
