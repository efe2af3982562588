//! Forwards device-reported exceptions to the error sink

use std::sync::Arc;

use serde::Deserialize;

use khala_broker::{Broker, ErrorSink, HandlerError, MessageHandler};
use khala_core::topic::Topic;
use khala_core::Payload;

use crate::formations::FormationMap;
use crate::handlers::device_info::{self, DeviceInfo};

#[derive(Debug, Deserialize)]
struct ExceptionReport {
    #[serde(default = "default_error")]
    error: String,
    #[serde(default = "default_context")]
    context: String,
}

fn default_error() -> String {
    "unknown exception on device".to_string()
}

fn default_context() -> String {
    "unknown originating topic".to_string()
}

struct Handler {
    formations: Arc<FormationMap>,
    sink: Arc<dyn ErrorSink>,
}

pub fn register(
    broker: &Arc<Broker>,
    formations: &Arc<FormationMap>,
    sink: &Arc<dyn ErrorSink>,
) {
    let handler = broker.register_handler(Arc::new(Handler {
        formations: Arc::clone(formations),
        sink: Arc::clone(sink),
    }));
    broker.subscribe("pylon/+/exception", handler);
}

impl MessageHandler for Handler {
    fn name(&self) -> &'static str {
        "exception"
    }

    fn handle_message(&self, topic: &str, payload: Payload) -> Result<(), HandlerError> {
        let Some(buf) = payload.as_bytes() else {
            return Err("expected a byte buffer".into());
        };
        let report: ExceptionReport = serde_json::from_slice(buf)?;
        let t = Topic::parse(topic);

        let device_os = self
            .formations
            .read()
            .device_state::<DeviceInfo>(&t.device_name, device_info::KEY)
            .map(|info| info.device_os.clone())
            .unwrap_or_else(|| "unknown".to_string());

        self.sink.notify(
            &format!("pylon:{}", report.context),
            &report.error,
            &[
                ("name", t.device_name.clone()),
                ("os_version", device_os),
            ],
        );
        Ok(())
    }
}
