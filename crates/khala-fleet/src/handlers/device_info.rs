//! Stores connect-time device metadata in the formation store

use std::sync::Arc;

use serde_json::{Map, Value};

use khala_broker::{Broker, HandlerError, MessageHandler};
use khala_core::events::connect_topic;
use khala_core::Payload;

use crate::formations::FormationMap;

/// Device-state key this handler writes
pub const KEY: &str = "device_info";

/// Metadata derived from the registry lookup at connect time.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_os: String,
}

struct Handler {
    formations: Arc<FormationMap>,
}

pub fn register(broker: &Arc<Broker>, formations: &Arc<FormationMap>) {
    let handler = broker.register_handler(Arc::new(Handler {
        formations: Arc::clone(formations),
    }));
    broker.subscribe(&connect_topic().to_string(), handler);
}

impl MessageHandler for Handler {
    fn name(&self) -> &'static str {
        "device-info"
    }

    fn handle_message(&self, _topic: &str, payload: Payload) -> Result<(), HandlerError> {
        let Payload::Connect(event) = payload else {
            return Err("expected a connect event".into());
        };

        let device_os = device_os(&event.device_info);
        self.formations.write().put_device_state(
            &event.formation_id,
            &event.device_name,
            KEY,
            DeviceInfo { device_os },
        );
        Ok(())
    }
}

/// `vendor-product-variant-version` from the current system image, or
/// `"unknown"` when any piece is missing.
fn device_os(info: &Map<String, Value>) -> String {
    let image = info
        .get("data")
        .and_then(Value::as_object)
        .and_then(|data| data.get("current_system_image"))
        .and_then(Value::as_object);

    let Some(image) = image else {
        return "unknown".to_string();
    };

    let vendor = image.get("vendor").and_then(Value::as_str);
    let product = image.get("product").and_then(Value::as_str);
    let variant = image.get("variant").and_then(Value::as_str);
    let version = image
        .get("version")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));

    match (vendor, product, variant, version) {
        (Some(vendor), Some(product), Some(variant), Some(version)) => {
            format!("{vendor}-{product}-{variant}-{version}")
        }
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn device_os_from_system_image() {
        let info = as_map(json!({
            "data": {
                "current_system_image": {
                    "vendor": "vantage",
                    "product": "ap70",
                    "variant": "core",
                    "version": 12
                }
            }
        }));
        assert_eq!(device_os(&info), "vantage-ap70-core-12");
    }

    #[test]
    fn device_os_accepts_float_version() {
        let info = as_map(json!({
            "data": { "current_system_image": {
                "vendor": "v", "product": "p", "variant": "x", "version": 44.0
            }}
        }));
        assert_eq!(device_os(&info), "v-p-x-44");
    }

    #[test]
    fn device_os_unknown_when_fields_missing() {
        assert_eq!(device_os(&Map::new()), "unknown");

        let partial = as_map(json!({
            "data": { "current_system_image": { "vendor": "v", "product": "p" } }
        }));
        assert_eq!(device_os(&partial), "unknown");
    }
}
