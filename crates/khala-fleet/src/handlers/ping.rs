//! Ping-loss aggregation
//!
//! Devices report raw sent/received counters for their internet, DNS,
//! gateway and tunnel probes on `pylon/<dev>/wan/ping`. The handler folds
//! them into running loss figures per device and republishes the full
//! snapshot on `matriarch/<dev>/wan/ping`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use khala_broker::{Broker, HandlerError, MessageHandler};
use khala_core::events::{subscribe_event_topic, SubscribeEvent};
use khala_core::topic::{filter_subscribe_topics, topics_match, Topic};
use khala_core::Payload;

use crate::formations::FormationMap;
use crate::handlers::{round_to, unix_now};

/// Device-state key this handler owns
pub const KEY: &str = "ping";

/// Sample-count floor applied when the 12 h window rolls over
const COUNT_FLOOR: i64 = 1000;

/// Window after which the running average is re-weighted
const RESET_WINDOW_SECS: i64 = 12 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub sent: i64,
    pub received: i64,
    #[serde(skip)]
    pub count: i64,
    pub loss_now: f64,
    pub loss_24_hours: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternetStats {
    pub ping: Stats,
    pub dns: Stats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayStats {
    pub ping: Stats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelStats {
    pub ping: Stats,
}

/// Wire shape of a ping report; also the folded per-device state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingReport {
    #[serde(default)]
    pub version: i64,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub internet: InternetStats,
    #[serde(default)]
    pub gateway: GatewayStats,
    #[serde(default)]
    pub tunnel: TunnelStats,
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
    broker.subscribe("pylon/+/wan/ping", handler.clone());
    broker.subscribe(&subscribe_event_topic().to_string(), handler);
}

impl MessageHandler for Handler {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn handle_message(&self, topic: &str, payload: Payload) -> Result<(), HandlerError> {
        if let Payload::Subscribe(event) = &payload {
            return self.on_subscribe_event(event);
        }

        let Some(buf) = payload.as_bytes() else {
            return Err("expected a byte buffer".into());
        };
        let report: PingReport = serde_json::from_slice(buf)?;
        let t = Topic::parse(topic);
        let now = unix_now();

        let mut formations = self.formations.write();
        if !formations.has_device_state(&t.device_name, KEY) {
            // First report seeds the state; the fold below runs it over itself.
            let formation_id = formations
                .formation_id(&t.device_name)
                .unwrap_or_default()
                .to_string();
            formations.put_device_state(&formation_id, &t.device_name, KEY, report.clone());
        }
        let updated = match formations.device_state_mut::<PingReport>(&t.device_name, KEY) {
            Some(state) => {
                fold_report(state, &report, now);
                state.clone()
            }
            None => {
                // Device unknown to the reverse index; fold standalone.
                let mut state = report.clone();
                fold_report(&mut state, &report, now);
                state
            }
        };
        drop(formations);

        self.publish_snapshot(&t.device_name, &updated)
    }
}

impl Handler {
    fn on_subscribe_event(&self, event: &SubscribeEvent) -> Result<(), HandlerError> {
        let snapshots: Vec<(String, PingReport)> = {
            let formations = self.formations.read();
            filter_subscribe_topics(event, replay_filter)
                .into_iter()
                .filter_map(|t| {
                    formations
                        .device_state::<PingReport>(&t.device_name, KEY)
                        .map(|state| (t.device_name, state.clone()))
                })
                .collect()
        };

        for (device_name, state) in snapshots {
            self.publish_snapshot(&device_name, &state)?;
        }
        Ok(())
    }

    fn publish_snapshot(&self, device_name: &str, state: &PingReport) -> Result<(), HandlerError> {
        self.broker.publish(
            &Topic::control(device_name, "wan/ping").to_string(),
            Payload::Json(serde_json::to_value(state)?),
        );
        Ok(())
    }
}

fn replay_filter(path: &str) -> bool {
    path == "#" || topics_match("wan/ping", path)
}

fn fold_report(state: &mut PingReport, report: &PingReport, now: i64) {
    let reset_count = now - state.timestamp >= RESET_WINDOW_SECS;
    if reset_count {
        state.timestamp = now;
    }

    update_losses(
        &mut state.internet.ping,
        report.internet.ping.sent,
        report.internet.ping.received,
        reset_count,
    );
    update_losses(
        &mut state.internet.dns,
        report.internet.dns.sent,
        report.internet.dns.received,
        reset_count,
    );
    update_losses(
        &mut state.gateway.ping,
        report.gateway.ping.sent,
        report.gateway.ping.received,
        reset_count,
    );
    update_losses(
        &mut state.tunnel.ping,
        report.tunnel.ping.sent,
        report.tunnel.ping.received,
        reset_count,
    );
}

/// Fold one counter sample into the running stats.
pub fn update_losses(stats: &mut Stats, sent: i64, received: i64, reset_count: bool) {
    if received == 0 {
        stats.loss_now = 1.0;
    } else {
        stats.loss_now = round_to(1.0 - received as f64 / sent as f64, 2);
    }

    stats.loss_24_hours =
        (stats.loss_24_hours * stats.count as f64 + stats.loss_now) / (stats.count + 1) as f64;
    stats.loss_24_hours = round_to(stats.loss_24_hours, 2);

    stats.count += 1;
    if reset_count {
        stats.count /= 2;
        if stats.count < COUNT_FLOOR {
            stats.count = COUNT_FLOOR;
        }
    }

    stats.sent = sent;
    stats.received = received;
}
