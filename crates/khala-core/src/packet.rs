//! MQTT 3.1.1 control packet types
//!
//! Only the packets this broker exchanges are modelled. QoS fields are
//! parsed so the wire layer stays conformant, but every delivery is made at
//! QoS 0.

use bytes::Bytes;

/// CONNACK return codes used by the handshake paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0x00,
    UnacceptableProtocol = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadCredentials = 0x04,
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::UnacceptableProtocol),
            0x02 => Some(Self::IdentifierRejected),
            0x03 => Some(Self::ServerUnavailable),
            0x04 => Some(Self::BadCredentials),
            0x05 => Some(Self::NotAuthorized),
            _ => None,
        }
    }
}

/// A will message carried in CONNECT. Accepted and ignored by this broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectPacket {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnackPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic_name: String,
    /// Present when qos > 0
    pub message_id: Option<u16>,
    pub payload: Bytes,
}

impl PublishPacket {
    /// QoS-0 publish, the only kind this broker emits.
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: 0,
            retain: false,
            topic_name: topic_name.into(),
            message_id: None,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub message_id: u16,
    /// Requested (filter, max QoS) pairs
    pub topics: Vec<(String, u8)>,
}

/// SUBACK return code granting QoS 0
pub const SUBACK_GRANTED_QOS0: u8 = 0x00;

/// SUBACK return code for a rejected filter
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubackPacket {
    pub message_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub message_id: u16,
    pub topics: Vec<String>,
}

/// An MQTT 3.1.1 control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Subscribe(SubscribePacket),
    Suback(SubackPacket),
    Unsubscribe(UnsubscribePacket),
    Unsuback { message_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    /// Packet name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::Connack(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::Suback(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::Unsuback { .. } => "UNSUBACK",
            Packet::Pingreq => "PINGREQ",
            Packet::Pingresp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}
