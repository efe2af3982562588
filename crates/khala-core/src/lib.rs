//! khala protocol core
//!
//! Shared primitives for the khala fleet broker:
//! - MQTT 3.1.1 control packet types and wire codec ([`packet`], [`codec`])
//! - Topic parsing and wildcard matching ([`topic`])
//! - The payload variant carried on the in-process bus ([`Payload`])
//! - Internal bus event types ([`events`])

pub mod codec;
pub mod error;
pub mod events;
pub mod packet;
pub mod payload;
pub mod topic;

pub use error::{Error, Result};
pub use events::{ConnectEvent, DisconnectEvent, SubscribeEvent};
pub use packet::{
    ConnackPacket, ConnectPacket, ConnectReturnCode, Packet, PublishPacket, SubackPacket,
    SubscribePacket, UnsubscribePacket,
};
pub use payload::Payload;
pub use topic::{filter_subscribe_topics, topics_match, Topic};
