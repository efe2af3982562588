//! Protocol-level scenarios: topic decomposition, round-trips, and a full
//! handshake exchange at the byte level

use bytes::BytesMut;

use khala_core::codec;
use khala_core::packet::{
    ConnackPacket, ConnectPacket, ConnectReturnCode, Packet, PublishPacket, SubscribePacket,
};
use khala_core::topic::{self, Topic};

#[test]
fn external_topic_decomposes_into_prefix_device_path() {
    let t = Topic::parse("/pylon/1.marsara/wifi/poll");
    assert_eq!(
        (t.prefix.as_str(), t.device_name.as_str(), t.path.as_str()),
        ("pylon", "1.marsara", "wifi/poll")
    );
}

#[test]
fn internal_topic_decomposes_without_device() {
    let t = Topic::parse("$khala/devices/connect");
    assert_eq!(
        (t.prefix.as_str(), t.device_name.as_str(), t.path.as_str()),
        ("$khala", "", "devices/connect")
    );
}

#[test]
fn parse_display_round_trips_modulo_leading_slash() {
    for raw in [
        "pylon/1.marsara/wifi/poll",
        "pylon/1.marsara/up",
        "matriarch/1.marsara/wan/ping",
        "matriarch/1.marsara/stations",
        "$khala/broker/subscribe",
    ] {
        assert_eq!(Topic::parse(raw).to_string(), raw);
        assert_eq!(Topic::parse(&format!("/{raw}")).to_string(), raw);
    }
}

#[test]
fn wildcard_match_truth_table() {
    let cases = [
        ("a/+/c", "a/b/c", true),
        ("a/+/c", "a/b/d", false),
        ("a/#", "a/b/c/d", true),
        ("a/#", "a", true),
        ("pylon/+/wan/ping", "pylon/1.marsara/wan/ping", true),
        ("pylon/+/wan/ping", "matriarch/1.marsara/wan/ping", false),
        ("matriarch/1.marsara/#", "matriarch/1.marsara/up", true),
    ];
    for (pattern, topic, expected) in cases {
        assert_eq!(
            topic::topics_match(pattern, topic),
            expected,
            "{pattern} vs {topic}"
        );
    }
}

#[test]
fn device_handshake_bytes_round_trip() {
    // The device side of the handshake: CONNECT out, CONNACK back.
    let connect = Packet::Connect(ConnectPacket {
        client_id: "1.marsara".to_string(),
        clean_session: true,
        keep_alive: 30,
        will: None,
        username: Some(
            r#"{"formation_id": "00000000-0000-0000-0000-000000000001"}"#.to_string(),
        ),
        password: None,
    });

    let wire = codec::encode(&connect).unwrap();
    let mut buf = BytesMut::from(&wire[..]);
    let decoded = codec::decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, connect);

    let connack = Packet::Connack(ConnackPacket {
        session_present: false,
        return_code: ConnectReturnCode::Accepted,
    });
    let wire = codec::encode(&connack).unwrap();
    assert_eq!(wire.len(), 4);
    let mut buf = BytesMut::from(&wire[..]);
    assert_eq!(codec::decode(&mut buf).unwrap().unwrap(), connack);
}

#[test]
fn pipelined_packets_decode_in_sequence() {
    let packets = [
        Packet::Subscribe(SubscribePacket {
            message_id: 1,
            topics: vec![("matriarch/1.marsara/#".to_string(), 0)],
        }),
        Packet::Publish(PublishPacket::new("pylon/1.marsara/net", &b"{}"[..])),
        Packet::Pingreq,
        Packet::Disconnect,
    ];

    let mut buf = BytesMut::new();
    for packet in &packets {
        buf.extend_from_slice(&codec::encode(packet).unwrap());
    }

    for expected in &packets {
        let decoded = codec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded, expected);
    }
    assert!(buf.is_empty());
}
