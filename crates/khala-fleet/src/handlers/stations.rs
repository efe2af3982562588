//! Station aggregation
//!
//! Builds the per-device picture the support frontend renders: wifi
//! stations seen by the access point, wired ("other") stations learned from
//! MAC/IP announcements, and discovered things. Stale wired stations and
//! things are aged out on every network update.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use khala_broker::{Broker, HandlerError, MessageHandler};
use khala_core::events::{subscribe_event_topic, SubscribeEvent};
use khala_core::topic::{filter_subscribe_topics, Topic};
use khala_core::Payload;

use crate::formations::{FormationMap, Formations};
use crate::handlers::{round_i64, unix_now};

/// Formation-state key this handler owns
pub const KEY: &str = "stations";

const LAN_STATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const THING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Open-shaped wifi station record, keyed by MAC
pub type WifiStation = Map<String, Value>;

#[derive(Debug, Clone, Serialize)]
pub struct LanStation {
    pub vendor: String,
    pub mac: String,
    pub ip: String,
    pub port: String,
    pub mode: String,
    pub local: bool,
    pub age: f64,
    pub seen: i64,
    #[serde(rename = "inactive_time")]
    pub inactive_secs: u64,
    #[serde(skip)]
    pub last_updated_at: SystemTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thing {
    pub vendor: String,
    pub mac: String,
    pub ip: String,
    pub port: String,
    pub mode: String,
    pub local: bool,
    pub age: f64,
    pub seen: i64,
    #[serde(rename = "inactive_time")]
    pub inactive_secs: u64,
    #[serde(skip)]
    pub last_updated_at: SystemTime,
    pub thing: Value,
}

/// Everything the handler tracks per formation.
#[derive(Debug, Clone, Default)]
pub struct State {
    /// MAC -> station fields
    pub wifi_stations: HashMap<String, WifiStation>,
    /// MAC -> wired station
    pub lan_stations: HashMap<String, LanStation>,
    /// IP -> thing
    pub things: HashMap<String, Thing>,
}

/// Shape published on `matriarch/<dev>/stations`.
#[derive(Debug, Serialize)]
struct StationsMessage {
    public: Vec<WifiStation>,
    private: Vec<WifiStation>,
    other: Vec<LanStation>,
    thing: Vec<Thing>,
}

#[derive(Debug, Deserialize)]
struct WifiPollMessage {
    #[serde(default)]
    interfaces: HashMap<String, WifiInterface>,
}

#[derive(Debug, Deserialize)]
struct WifiInterface {
    #[serde(default)]
    stations: HashMap<String, WifiStation>,
}

#[derive(Debug, Deserialize)]
struct WifiEventMessage {
    action: String,
    mac: String,
}

#[derive(Debug, Deserialize)]
struct NetMessage {
    #[serde(default)]
    mac: Vec<MacEntry>,
}

#[derive(Debug, Deserialize)]
struct MacEntry {
    mac: String,
    ip: String,
}

struct Handler {
    broker: Arc<Broker>,
    formations: Arc<FormationMap>,
}

pub fn register(broker: &Arc<Broker>, formations: &Arc<FormationMap>) {
    let handler = broker.register_handler(Arc::new(Handler {
        broker: Arc::clone(broker),
        formations: Arc::clone(formations),
    }));
    broker.subscribe("pylon/+/wifi/poll", handler.clone());
    broker.subscribe("pylon/+/wifi/event", handler.clone());
    broker.subscribe("pylon/+/things/discovery", handler.clone());
    broker.subscribe("pylon/+/net", handler.clone());
    broker.subscribe(&subscribe_event_topic().to_string(), handler);
}

impl MessageHandler for Handler {
    fn name(&self) -> &'static str {
        "stations"
    }

    fn handle_message(&self, topic: &str, payload: Payload) -> Result<(), HandlerError> {
        if let Payload::Subscribe(event) = &payload {
            return self.on_subscribe_event(event);
        }

        let Some(buf) = payload.as_bytes() else {
            return Err("expected a byte buffer".into());
        };
        let t = Topic::parse(topic);

        match t.path.as_str() {
            "wifi/poll" => self.on_wifi_poll(&t, serde_json::from_slice(buf)?),
            "wifi/event" => self.on_wifi_event(&t, serde_json::from_slice(buf)?),
            "things/discovery" => self.on_things(&t, serde_json::from_slice(buf)?),
            "net" => self.on_net(&t, serde_json::from_slice(buf)?),
            _ => Ok(()),
        }
    }
}

impl Handler {
    fn on_subscribe_event(&self, event: &SubscribeEvent) -> Result<(), HandlerError> {
        let snapshots: Vec<(String, State)> = {
            let formations = self.formations.read();
            filter_subscribe_topics(event, |path| path == "#" || path == "stations")
                .into_iter()
                .filter_map(|t| {
                    let formation_id = formations.formation_id(&t.device_name)?;
                    formations
                        .state::<State>(formation_id, KEY)
                        .map(|state| (t.device_name, state.clone()))
                })
                .collect()
        };

        for (device_name, state) in snapshots {
            self.publish(&device_name, &state);
        }
        Ok(())
    }

    fn on_wifi_poll(&self, t: &Topic, msg: WifiPollMessage) -> Result<(), HandlerError> {
        let mut formations = self.formations.write();
        let (mut state, formation_id) = current_state(&formations, &t.device_name);

        for (interface_name, interface) in msg.interfaces {
            for (mac, mut fields) in interface.stations {
                fields.insert("mac".to_string(), Value::String(mac.clone()));
                fields.insert(
                    "interface".to_string(),
                    Value::String(interface_name.clone()),
                );
                match state.wifi_stations.entry(mac) {
                    Entry::Occupied(mut existing) => existing.get_mut().extend(fields),
                    Entry::Vacant(slot) => {
                        slot.insert(fields);
                    }
                }
            }
        }

        formations.put_state(&formation_id, KEY, state.clone());
        drop(formations);

        self.publish(&t.device_name, &state);
        Ok(())
    }

    fn on_wifi_event(&self, t: &Topic, msg: WifiEventMessage) -> Result<(), HandlerError> {
        let mut formations = self.formations.write();
        let (mut state, formation_id) = current_state(&formations, &t.device_name);

        match msg.action.as_str() {
            "assoc" => {
                let mut station = WifiStation::new();
                station.insert("mac".to_string(), Value::String(msg.mac.clone()));
                state.wifi_stations.insert(msg.mac, station);
            }
            "disassoc" => {
                state.wifi_stations.remove(&msg.mac);
            }
            other => warn!(device = %t.device_name, action = other, "unknown wifi event"),
        }

        formations.put_state(&formation_id, KEY, state.clone());
        drop(formations);

        self.publish(&t.device_name, &state);
        Ok(())
    }

    fn on_things(&self, t: &Topic, msg: Map<String, Value>) -> Result<(), HandlerError> {
        let (Some(ip), Some(thing_data)) = (
            msg.get("address").and_then(Value::as_str),
            msg.get("thing").and_then(Value::as_object),
        ) else {
            return Err(format!("invalid things discovery message: {msg:?}").into());
        };

        let mut formations = self.formations.write();
        let (mut state, formation_id) = current_state(&formations, &t.device_name);
        let now = SystemTime::now();

        match state.things.entry(ip.to_string()) {
            Entry::Occupied(mut slot) => {
                let thing = slot.get_mut();
                thing.thing = Value::Object(thing_data.clone());
                thing.last_updated_at = now;
            }
            Entry::Vacant(slot) => {
                slot.insert(Thing {
                    vendor: String::new(),
                    mac: String::new(),
                    ip: ip.to_string(),
                    port: String::new(),
                    mode: "thing".to_string(),
                    local: false,
                    age: 0.0,
                    seen: 0,
                    inactive_secs: 0,
                    last_updated_at: now,
                    thing: Value::Object(thing_data.clone()),
                });
            }
        }

        formations.put_state(&formation_id, KEY, state.clone());
        drop(formations);

        self.publish(&t.device_name, &state);
        Ok(())
    }

    fn on_net(&self, t: &Topic, msg: NetMessage) -> Result<(), HandlerError> {
        let mut formations = self.formations.write();
        let (mut state, formation_id) = current_state(&formations, &t.device_name);
        let now = SystemTime::now();

        for entry in msg.mac {
            if let Some(thing) = state.things.get_mut(&entry.ip) {
                thing.mac = entry.mac;
                thing.last_updated_at = now;
            } else if let Some(station) = state.wifi_stations.get_mut(&entry.mac) {
                station.insert("ip".to_string(), Value::String(entry.ip));
            } else {
                state.lan_stations.insert(
                    entry.mac.clone(),
                    LanStation {
                        vendor: String::new(),
                        mac: entry.mac,
                        ip: entry.ip,
                        port: String::new(),
                        mode: "other".to_string(),
                        local: false,
                        age: 0.0,
                        seen: 0,
                        inactive_secs: 0,
                        last_updated_at: now,
                    },
                );
            }
        }

        remove_timed_out_stations(&mut state, now);

        formations.put_state(&formation_id, KEY, state.clone());
        drop(formations);

        self.publish(&t.device_name, &state);
        Ok(())
    }

    fn publish(&self, device_name: &str, state: &State) {
        let now = unix_now();

        let mut msg = StationsMessage {
            public: Vec::new(),
            private: Vec::new(),
            other: Vec::with_capacity(state.lan_stations.len()),
            thing: Vec::new(),
        };

        for station in state.wifi_stations.values() {
            let mut station = station.clone();
            if let Some(age) = station.get("age").and_then(Value::as_f64) {
                station.insert("seen".to_string(), Value::from(now - round_i64(age)));
            }
            if station.get("mode").and_then(Value::as_str) == Some("public") {
                msg.public.push(station);
            } else {
                msg.private.push(station);
            }
        }

        for thing in state.things.values() {
            if !thing.mac.is_empty() {
                let mut thing = thing.clone();
                thing.seen = now - round_i64(thing.age);
                msg.thing.push(thing);
            }
        }

        for station in state.lan_stations.values() {
            let mut station = station.clone();
            station.seen = now - round_i64(station.age);
            msg.other.push(station);
        }

        match serde_json::to_value(&msg) {
            Ok(value) => self.broker.publish(
                &Topic::control(device_name, "stations").to_string(),
                Payload::Json(value),
            ),
            Err(e) => warn!(device = device_name, error = %e, "cannot encode stations message"),
        }
    }
}

/// The formation's station state (cloned for mutation) and its id.
fn current_state(formations: &Formations, device_name: &str) -> (State, String) {
    let formation_id = formations
        .formation_id(device_name)
        .unwrap_or_default()
        .to_string();
    let state = formations
        .state::<State>(&formation_id, KEY)
        .cloned()
        .unwrap_or_default();
    (state, formation_id)
}

fn remove_timed_out_stations(state: &mut State, now: SystemTime) {
    state.lan_stations.retain(|_, station| {
        let inactive = now
            .duration_since(station.last_updated_at)
            .unwrap_or_default();
        station.inactive_secs = inactive.as_secs();
        inactive <= LAN_STATION_TIMEOUT
    });

    state.things.retain(|_, thing| {
        let inactive = now.duration_since(thing.last_updated_at).unwrap_or_default();
        thing.inactive_secs = inactive.as_secs();
        inactive <= THING_TIMEOUT
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_lan_station(mac: &str, at: SystemTime) -> LanStation {
        LanStation {
            vendor: String::new(),
            mac: mac.to_string(),
            ip: "10.0.0.9".to_string(),
            port: String::new(),
            mode: "other".to_string(),
            local: false,
            age: 0.0,
            seen: 0,
            inactive_secs: 0,
            last_updated_at: at,
        }
    }

    #[test]
    fn stale_lan_stations_are_removed() {
        let now = SystemTime::now();
        let mut state = State::default();
        state
            .lan_stations
            .insert("aa:bb".into(), fresh_lan_station("aa:bb", now));
        state.lan_stations.insert(
            "cc:dd".into(),
            fresh_lan_station("cc:dd", now - LAN_STATION_TIMEOUT - Duration::from_secs(1)),
        );

        remove_timed_out_stations(&mut state, now);
        assert!(state.lan_stations.contains_key("aa:bb"));
        assert!(!state.lan_stations.contains_key("cc:dd"));
    }

    #[test]
    fn wifi_poll_message_parses_station_fields() {
        let raw = r#"{
            "interfaces": {
                "wlan0": {
                    "stations": {
                        "aa:bb:cc:dd:ee:ff": {"mode": "public", "age": 3.2}
                    }
                }
            }
        }"#;
        let msg: WifiPollMessage = serde_json::from_str(raw).unwrap();
        let iface = &msg.interfaces["wlan0"];
        let station = &iface.stations["aa:bb:cc:dd:ee:ff"];
        assert_eq!(station.get("mode").and_then(Value::as_str), Some("public"));
    }

    #[test]
    fn net_message_tolerates_missing_sections() {
        let msg: NetMessage = serde_json::from_str("{}").unwrap();
        assert!(msg.mac.is_empty());
    }
}
