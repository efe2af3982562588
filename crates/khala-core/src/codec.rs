//! MQTT 3.1.1 wire encoding/decoding
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Byte 0:      packet type (bits 7-4) | flags (bits 3-0)   │
//! │ Byte 1..:    remaining length (1-4 byte varint)          │
//! ├──────────────────────────────────────────────────────────┤
//! │ Variable header + payload (per packet type)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! [`decode`] is incremental: it consumes nothing and returns `Ok(None)`
//! until a whole packet is buffered, so the session read loop can append
//! socket reads and retry.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::packet::{
    ConnackPacket, ConnectPacket, ConnectReturnCode, LastWill, Packet, PublishPacket,
    SubackPacket, SubscribePacket, UnsubscribePacket,
};

/// Upper bound on a single control packet
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const CONNECT_FLAG_RESERVED: u8 = 0x01;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_WILL_QOS_MASK: u8 = 0x18;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_USERNAME: u8 = 0x80;

/// Try to decode one packet from the front of `buf`. Returns `Ok(None)` if
/// more bytes are needed; on success the packet's bytes are consumed.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let (remaining, header_len) = match decode_remaining_length(&buf[1..])? {
        Some(v) => v,
        None => return Ok(None),
    };

    let total = 1 + header_len + remaining;
    if total > MAX_PACKET_SIZE {
        return Err(Error::PacketTooLarge(total));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let mut body = buf.split_to(total).freeze();
    body.advance(1 + header_len);

    let packet_type = first >> 4;
    let flags = first & 0x0f;

    let packet = match packet_type {
        1 => decode_connect(&mut body, flags)?,
        2 => decode_connack(&mut body, flags)?,
        3 => decode_publish(&mut body, flags)?,
        8 => decode_subscribe(&mut body, flags)?,
        9 => decode_suback(&mut body, flags)?,
        10 => decode_unsubscribe(&mut body, flags)?,
        11 => {
            expect_flags("UNSUBACK", flags, 0)?;
            Packet::Unsuback {
                message_id: read_u16(&mut body, "UNSUBACK")?,
            }
        }
        12 => {
            expect_flags("PINGREQ", flags, 0)?;
            Packet::Pingreq
        }
        13 => {
            expect_flags("PINGRESP", flags, 0)?;
            Packet::Pingresp
        }
        14 => {
            expect_flags("DISCONNECT", flags, 0)?;
            Packet::Disconnect
        }
        other => return Err(Error::InvalidPacketType(other)),
    };

    Ok(Some(packet))
}

/// Encode a packet into a fresh buffer.
pub fn encode(packet: &Packet) -> Result<Bytes> {
    let mut body = BytesMut::new();
    let first = match packet {
        Packet::Connect(p) => {
            encode_connect(p, &mut body);
            1 << 4
        }
        Packet::Connack(p) => {
            body.put_u8(u8::from(p.session_present));
            body.put_u8(p.return_code as u8);
            2 << 4
        }
        Packet::Publish(p) => {
            put_string(&mut body, &p.topic_name);
            if p.qos > 0 {
                body.put_u16(p.message_id.unwrap_or(0));
            }
            body.extend_from_slice(&p.payload);
            (3 << 4) | (u8::from(p.dup) << 3) | (p.qos << 1) | u8::from(p.retain)
        }
        Packet::Subscribe(p) => {
            body.put_u16(p.message_id);
            for (filter, qos) in &p.topics {
                put_string(&mut body, filter);
                body.put_u8(*qos);
            }
            (8 << 4) | 0x02
        }
        Packet::Suback(p) => {
            body.put_u16(p.message_id);
            body.extend_from_slice(&p.return_codes);
            9 << 4
        }
        Packet::Unsubscribe(p) => {
            body.put_u16(p.message_id);
            for filter in &p.topics {
                put_string(&mut body, filter);
            }
            (10 << 4) | 0x02
        }
        Packet::Unsuback { message_id } => {
            body.put_u16(*message_id);
            11 << 4
        }
        Packet::Pingreq => 12 << 4,
        Packet::Pingresp => 13 << 4,
        Packet::Disconnect => 14 << 4,
    };

    if body.len() > MAX_PACKET_SIZE {
        return Err(Error::PacketTooLarge(body.len()));
    }

    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(first);
    encode_remaining_length(&mut out, body.len());
    out.extend_from_slice(&body);
    Ok(out.freeze())
}

fn decode_connect(body: &mut Bytes, flags: u8) -> Result<Packet> {
    expect_flags("CONNECT", flags, 0)?;

    let protocol = read_string(body, "protocol name")?;
    if protocol != PROTOCOL_NAME {
        return Err(Error::InvalidProtocolName(protocol));
    }
    if body.remaining() < 1 {
        return Err(Error::Truncated("CONNECT"));
    }
    let level = body.get_u8();
    if level != PROTOCOL_LEVEL {
        return Err(Error::UnsupportedProtocolLevel(level));
    }

    if body.remaining() < 3 {
        return Err(Error::Truncated("CONNECT"));
    }
    let connect_flags = body.get_u8();
    if connect_flags & CONNECT_FLAG_RESERVED != 0 {
        return Err(Error::InvalidConnectFlags(connect_flags));
    }
    // Bits 6-7: a password flag without the username flag is invalid.
    if connect_flags & CONNECT_FLAG_PASSWORD != 0 && connect_flags & CONNECT_FLAG_USERNAME == 0 {
        return Err(Error::InvalidConnectFlags(connect_flags));
    }
    // Bits 3-5 carry the will QoS and retain; they require the will flag,
    // and QoS 3 does not exist.
    let will_flag = connect_flags & CONNECT_FLAG_WILL != 0;
    if !will_flag && connect_flags & (CONNECT_FLAG_WILL_QOS_MASK | CONNECT_FLAG_WILL_RETAIN) != 0 {
        return Err(Error::InvalidConnectFlags(connect_flags));
    }
    if will_flag && (connect_flags >> 3) & 0x03 == 3 {
        return Err(Error::InvalidConnectFlags(connect_flags));
    }
    let keep_alive = body.get_u16();

    let client_id = read_string(body, "client identifier")?;

    let will = if will_flag {
        let topic = read_string(body, "will topic")?;
        let message = read_bytes(body, "will message")?;
        Some(LastWill {
            topic,
            message,
            qos: (connect_flags >> 3) & 0x03,
            retain: connect_flags & CONNECT_FLAG_WILL_RETAIN != 0,
        })
    } else {
        None
    };

    let username = if connect_flags & CONNECT_FLAG_USERNAME != 0 {
        Some(read_string(body, "username")?)
    } else {
        None
    };
    let password = if connect_flags & CONNECT_FLAG_PASSWORD != 0 {
        Some(read_bytes(body, "password")?)
    } else {
        None
    };

    Ok(Packet::Connect(ConnectPacket {
        client_id,
        clean_session: connect_flags & CONNECT_FLAG_CLEAN_SESSION != 0,
        keep_alive,
        will,
        username,
        password,
    }))
}

fn encode_connect(p: &ConnectPacket, body: &mut BytesMut) {
    put_string(body, PROTOCOL_NAME);
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if p.clean_session {
        flags |= CONNECT_FLAG_CLEAN_SESSION;
    }
    if let Some(will) = &p.will {
        flags |= CONNECT_FLAG_WILL | (will.qos << 3);
        if will.retain {
            flags |= CONNECT_FLAG_WILL_RETAIN;
        }
    }
    if p.username.is_some() {
        flags |= CONNECT_FLAG_USERNAME;
    }
    if p.password.is_some() {
        flags |= CONNECT_FLAG_PASSWORD;
    }
    body.put_u8(flags);
    body.put_u16(p.keep_alive);

    put_string(body, &p.client_id);
    if let Some(will) = &p.will {
        put_string(body, &will.topic);
        body.put_u16(will.message.len() as u16);
        body.extend_from_slice(&will.message);
    }
    if let Some(username) = &p.username {
        put_string(body, username);
    }
    if let Some(password) = &p.password {
        body.put_u16(password.len() as u16);
        body.extend_from_slice(password);
    }
}

fn decode_connack(body: &mut Bytes, flags: u8) -> Result<Packet> {
    expect_flags("CONNACK", flags, 0)?;
    if body.remaining() < 2 {
        return Err(Error::Truncated("CONNACK"));
    }
    let session_present = body.get_u8() & 0x01 != 0;
    let code = body.get_u8();
    let return_code = ConnectReturnCode::from_u8(code).ok_or(Error::Truncated("CONNACK"))?;
    Ok(Packet::Connack(ConnackPacket {
        session_present,
        return_code,
    }))
}

fn decode_publish(body: &mut Bytes, flags: u8) -> Result<Packet> {
    let dup = flags & 0x08 != 0;
    let qos = (flags >> 1) & 0x03;
    let retain = flags & 0x01 != 0;
    if qos == 3 {
        return Err(Error::InvalidFlags {
            packet: "PUBLISH",
            flags,
        });
    }

    let topic_name = read_string(body, "topic name")?;
    let message_id = if qos > 0 {
        Some(read_u16(body, "PUBLISH")?)
    } else {
        None
    };

    Ok(Packet::Publish(PublishPacket {
        dup,
        qos,
        retain,
        topic_name,
        message_id,
        payload: body.split_off(0),
    }))
}

fn decode_subscribe(body: &mut Bytes, flags: u8) -> Result<Packet> {
    expect_flags("SUBSCRIBE", flags, 0x02)?;
    let message_id = read_u16(body, "SUBSCRIBE")?;

    let mut topics = Vec::new();
    while body.has_remaining() {
        let filter = read_string(body, "topic filter")?;
        if body.remaining() < 1 {
            return Err(Error::Truncated("SUBSCRIBE"));
        }
        topics.push((filter, body.get_u8() & 0x03));
    }
    if topics.is_empty() {
        return Err(Error::Truncated("SUBSCRIBE"));
    }

    Ok(Packet::Subscribe(SubscribePacket { message_id, topics }))
}

fn decode_suback(body: &mut Bytes, flags: u8) -> Result<Packet> {
    expect_flags("SUBACK", flags, 0)?;
    let message_id = read_u16(body, "SUBACK")?;
    let return_codes = body.split_off(0).to_vec();
    Ok(Packet::Suback(SubackPacket {
        message_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &mut Bytes, flags: u8) -> Result<Packet> {
    expect_flags("UNSUBSCRIBE", flags, 0x02)?;
    let message_id = read_u16(body, "UNSUBSCRIBE")?;

    let mut topics = Vec::new();
    while body.has_remaining() {
        topics.push(read_string(body, "topic filter")?);
    }
    if topics.is_empty() {
        return Err(Error::Truncated("UNSUBSCRIBE"));
    }

    Ok(Packet::Unsubscribe(UnsubscribePacket { message_id, topics }))
}

/// Returns `(value, encoded length)` or `None` if the varint is still
/// incomplete in `buf`.
fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(Error::MalformedRemainingLength);
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    if buf.len() >= 4 {
        return Err(Error::MalformedRemainingLength);
    }
    Ok(None)
}

fn encode_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn expect_flags(packet: &'static str, flags: u8, expected: u8) -> Result<()> {
    if flags != expected {
        return Err(Error::InvalidFlags { packet, flags });
    }
    Ok(())
}

fn read_u16(buf: &mut Bytes, what: &'static str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::Truncated(what));
    }
    Ok(buf.get_u16())
}

fn read_bytes(buf: &mut Bytes, what: &'static str) -> Result<Bytes> {
    let len = read_u16(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(Error::Truncated(what));
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes, what: &'static str) -> Result<String> {
    let raw = read_bytes(buf, what)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidString(what))
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Packet {
        let mut buf = BytesMut::from(bytes);
        decode(&mut buf).unwrap().expect("whole packet buffered")
    }

    #[test]
    fn connect_with_username_decodes() {
        // client id "abc", clean session, keep-alive 60, username "user1"
        let bytes = [
            0x10, 0x16, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x82, 0x00, 0x3c, 0x00, 0x03,
            b'a', b'b', b'c', 0x00, 0x05, b'u', b's', b'e', b'r', b'1',
        ];
        let Packet::Connect(p) = decode_all(&bytes) else {
            panic!("expected CONNECT");
        };
        assert_eq!(p.client_id, "abc");
        assert!(p.clean_session);
        assert_eq!(p.keep_alive, 60);
        assert_eq!(p.username.as_deref(), Some("user1"));
        assert!(p.password.is_none());
        assert!(p.will.is_none());
    }

    #[test]
    fn connect_reserved_flag_rejected() {
        let bytes = [
            0x10, 0x0f, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3c, 0x00, 0x03,
            b'a', b'b', b'c',
        ];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(Error::InvalidConnectFlags(0x03))
        ));
    }

    #[test]
    fn connect_password_without_username_rejected() {
        // flags 0x42: clean session + password flag (bit 6) with the
        // username flag (bit 7) clear
        let bytes = [
            0x10, 0x15, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x42, 0x00, 0x3c, 0x00, 0x03,
            b'a', b'b', b'c', 0x00, 0x04, b'p', b'a', b's', b's',
        ];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(Error::InvalidConnectFlags(0x42))
        ));
    }

    #[test]
    fn connect_will_bits_without_will_flag_rejected() {
        // flags 0x0a: clean session + will QoS 1 bit set with no will flag
        let bytes = [
            0x10, 0x0f, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x0a, 0x00, 0x3c, 0x00, 0x03,
            b'a', b'b', b'c',
        ];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(Error::InvalidConnectFlags(0x0a))
        ));
    }

    #[test]
    fn connect_will_qos_three_rejected() {
        // flags 0x1e: clean session + will flag + both will QoS bits
        let bytes = [
            0x10, 0x0f, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x1e, 0x00, 0x3c, 0x00, 0x03,
            b'a', b'b', b'c',
        ];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(Error::InvalidConnectFlags(0x1e))
        ));
    }

    #[test]
    fn connect_bad_protocol_level_rejected() {
        let bytes = [
            0x10, 0x0f, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3c, 0x00, 0x03,
            b'a', b'b', b'c',
        ];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(Error::UnsupportedProtocolLevel(5))
        ));
    }

    #[test]
    fn publish_qos0_round_trips() {
        let pkt = Packet::Publish(PublishPacket::new("pylon/1.marsara/wan/ping", &b"{}"[..]));
        let wire = encode(&pkt).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), pkt);
        assert!(buf.is_empty());
    }

    #[test]
    fn publish_qos1_carries_message_id() {
        let pkt = Packet::Publish(PublishPacket {
            dup: false,
            qos: 1,
            retain: false,
            topic_name: "a/b".into(),
            message_id: Some(7),
            payload: Bytes::from_static(b"x"),
        });
        let wire = encode(&pkt).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let Packet::Publish(p) = decode(&mut buf).unwrap().unwrap() else {
            panic!("expected PUBLISH");
        };
        assert_eq!(p.message_id, Some(7));
        assert_eq!(&p.payload[..], b"x");
    }

    #[test]
    fn subscribe_round_trips() {
        let pkt = Packet::Subscribe(SubscribePacket {
            message_id: 42,
            topics: vec![("matriarch/1.marsara/#".into(), 0), ("pylon/+/up".into(), 1)],
        });
        let wire = encode(&pkt).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), pkt);
    }

    #[test]
    fn subscribe_requires_exact_flags() {
        // SUBSCRIBE with flags 0000 is a protocol violation
        let bytes = [0x80, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x00];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(Error::InvalidFlags {
                packet: "SUBSCRIBE",
                ..
            })
        ));
    }

    #[test]
    fn empty_body_packets_round_trip() {
        for pkt in [Packet::Pingreq, Packet::Pingresp, Packet::Disconnect] {
            let wire = encode(&pkt).unwrap();
            assert_eq!(wire.len(), 2);
            let mut buf = BytesMut::from(&wire[..]);
            assert_eq!(decode(&mut buf).unwrap().unwrap(), pkt);
        }
    }

    #[test]
    fn decode_is_incremental() {
        let pkt = Packet::Publish(PublishPacket::new("a/b/c", &b"payload"[..]));
        let wire = encode(&pkt).unwrap();

        let mut buf = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let res = decode(&mut buf).unwrap();
            if i < wire.len() - 1 {
                assert!(res.is_none(), "partial packet must not decode");
            } else {
                assert_eq!(res.unwrap(), pkt);
            }
        }
    }

    #[test]
    fn decode_leaves_following_packet_in_buffer() {
        let a = encode(&Packet::Pingreq).unwrap();
        let b = encode(&Packet::Disconnect).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        assert_eq!(decode(&mut buf).unwrap().unwrap(), Packet::Pingreq);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), Packet::Disconnect);
        assert!(buf.is_empty());
    }

    #[test]
    fn multi_byte_remaining_length() {
        let payload = vec![0u8; 300];
        let pkt = Packet::Publish(PublishPacket::new("t", payload.clone()));
        let wire = encode(&pkt).unwrap();
        // 300 byte payload + topic pushes the length field to two bytes
        assert!(wire[1] & 0x80 != 0);
        let mut buf = BytesMut::from(&wire[..]);
        let Packet::Publish(p) = decode(&mut buf).unwrap().unwrap() else {
            panic!("expected PUBLISH");
        };
        assert_eq!(p.payload.len(), 300);
    }

    #[test]
    fn oversized_remaining_length_rejected() {
        let bytes = [0x30, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(Error::MalformedRemainingLength) | Err(Error::PacketTooLarge(_))
        ));
    }

    #[test]
    fn unknown_packet_type_rejected() {
        let mut buf = BytesMut::from(&[0xf0u8, 0x00][..]);
        assert!(matches!(decode(&mut buf), Err(Error::InvalidPacketType(15))));
    }
}
