//! Internal bus events
//!
//! These are published on in-process-only topics and delivered to handlers
//! as typed values; they are never forwarded to a network subscriber.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::topic::Topic;

/// Path of the device connect event topic
pub const CONNECT_EVENT_PATH: &str = "devices/connect";

/// Path of the device disconnect event topic
pub const DISCONNECT_EVENT_PATH: &str = "devices/disconnect";

/// Path of the subscribe-replay trigger topic
pub const SUBSCRIBE_EVENT_PATH: &str = "broker/subscribe";

/// Topic a [`ConnectEvent`] is published on
pub fn connect_topic() -> Topic {
    Topic::internal(CONNECT_EVENT_PATH)
}

/// Topic a [`DisconnectEvent`] is published on
pub fn disconnect_topic() -> Topic {
    Topic::internal(DISCONNECT_EVENT_PATH)
}

/// Topic a [`SubscribeEvent`] is published on
pub fn subscribe_event_topic() -> Topic {
    Topic::internal(SUBSCRIBE_EVENT_PATH)
}

/// Published once per accepted device CONNECT.
///
/// Also doubles as the parse target for the CONNECT username, which carries
/// `formation_id` and `ip_address` as a JSON object; the remaining fields
/// are filled in during the handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectEvent {
    #[serde(default)]
    pub formation_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub device_info: Map<String, Value>,
    #[serde(default)]
    pub ip_address: String,
}

/// Published exactly once per device session termination, whatever the cause.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectEvent {
    pub formation_id: String,
    pub device_name: String,
}

/// Published after a control client's SUBSCRIBE has been accepted, carrying
/// the granted topic filters. Snapshot handlers use it to replay state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeEvent {
    pub topics: Vec<String>,
}
