//! Reachability ("up") state
//!
//! While a device session is alive the handler republishes
//! `{state: "up", timestamp}` on `matriarch/<dev>/up` every 30 seconds; on
//! disconnect it stops the task and publishes `down`. Unlike most device
//! state, the task handle is rewritten on every connect.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;

use khala_broker::{Broker, HandlerError, MessageHandler};
use khala_core::events::{
    connect_topic, disconnect_topic, subscribe_event_topic, ConnectEvent, DisconnectEvent,
    SubscribeEvent,
};
use khala_core::topic::{filter_subscribe_topics, Topic};
use khala_core::Payload;

use crate::formations::FormationMap;
use crate::handlers::unix_now;

/// Device-state key holding the republish task handle
pub const KEY: &str = "up_task";

const UP: &str = "up";
const DOWN: &str = "down";

const REPUBLISH_INTERVAL: Duration = Duration::from_secs(30);

struct UpTask(AbortHandle);

struct Handler {
    broker: Arc<Broker>,
    formations: Arc<FormationMap>,
}

pub fn register(broker: &Arc<Broker>, formations: &Arc<FormationMap>) {
    let handler = broker.register_handler(Arc::new(Handler {
        broker: Arc::clone(broker),
        formations: Arc::clone(formations),
    }));
    broker.subscribe(&connect_topic().to_string(), handler.clone());
    broker.subscribe(&disconnect_topic().to_string(), handler.clone());
    broker.subscribe(&subscribe_event_topic().to_string(), handler);
}

impl MessageHandler for Handler {
    fn name(&self) -> &'static str {
        "up"
    }

    fn handle_message(&self, _topic: &str, payload: Payload) -> Result<(), HandlerError> {
        match payload {
            Payload::Connect(event) => self.on_connect(&event),
            Payload::Disconnect(event) => self.on_disconnect(&event),
            Payload::Subscribe(event) => self.on_subscribe_event(&event),
            _ => Ok(()),
        }
    }
}

impl Handler {
    fn on_connect(&self, event: &ConnectEvent) -> Result<(), HandlerError> {
        publish_up_msg(&self.broker, &event.device_name, UP);

        let broker = Arc::clone(&self.broker);
        let device_name = event.device_name.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(REPUBLISH_INTERVAL).await;
                publish_up_msg(&broker, &device_name, UP);
            }
        });

        self.formations.write().put_device_state(
            &event.formation_id,
            &event.device_name,
            KEY,
            UpTask(task.abort_handle()),
        );
        Ok(())
    }

    fn on_disconnect(&self, event: &DisconnectEvent) -> Result<(), HandlerError> {
        let taken = self.formations.write().delete_device_state(
            &event.formation_id,
            &event.device_name,
            KEY,
        );
        let Some(taken) = taken else {
            return Err(format!("no up republish task for device {}", event.device_name).into());
        };

        if let Some(task) = taken.downcast_ref::<UpTask>() {
            task.0.abort();
        }
        publish_up_msg(&self.broker, &event.device_name, DOWN);
        Ok(())
    }

    fn on_subscribe_event(&self, event: &SubscribeEvent) -> Result<(), HandlerError> {
        let formations = self.formations.read();
        for t in filter_subscribe_topics(event, |path| path == "up" || path == "#") {
            let state = if formations.has_device_state(&t.device_name, KEY) {
                UP
            } else {
                DOWN
            };
            publish_up_msg(&self.broker, &t.device_name, state);
        }
        Ok(())
    }
}

fn publish_up_msg(broker: &Broker, device_name: &str, state: &str) {
    let msg = serde_json::json!({
        "state": state,
        "timestamp": unix_now(),
    });
    broker.publish(
        &Topic::control(device_name, "up").to_string(),
        Payload::Json(msg),
    );
}
