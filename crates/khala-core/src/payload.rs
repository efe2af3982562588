//! Bus payload variant
//!
//! The broker carries two kinds of payload on one subscription table: raw
//! bytes straight off the wire, and typed values produced in-process. A
//! handler pattern-matches on arrival; the network egress path coerces every
//! non-byte variant to JSON.

use bytes::Bytes;
use serde_json::Value;

use crate::error::Result;
use crate::events::{ConnectEvent, DisconnectEvent, SubscribeEvent};

/// A value travelling on the in-process bus
#[derive(Debug, Clone)]
pub enum Payload {
    /// Wire telemetry, delivered verbatim
    Bytes(Bytes),
    /// Device connect event (internal topics only)
    Connect(ConnectEvent),
    /// Device disconnect event (internal topics only)
    Disconnect(DisconnectEvent),
    /// Subscribe-replay trigger (internal topics only)
    Subscribe(SubscribeEvent),
    /// A typed snapshot computed by a handler
    Json(Value),
}

impl Payload {
    /// Encode for delivery to a network subscriber: bytes pass through,
    /// everything else becomes JSON.
    pub fn to_wire(&self) -> Result<Bytes> {
        Ok(match self {
            Payload::Bytes(b) => b.clone(),
            Payload::Connect(ev) => serde_json::to_vec(ev)?.into(),
            Payload::Disconnect(ev) => serde_json::to_vec(ev)?.into(),
            Payload::Subscribe(ev) => serde_json::to_vec(ev)?.into(),
            Payload::Json(v) => serde_json::to_vec(v)?.into(),
        })
    }

    /// The raw byte view, if this is wire telemetry.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b.into())
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}
