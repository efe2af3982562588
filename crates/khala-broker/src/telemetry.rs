//! Process-local counters and the error-sink seam
//!
//! Client gauges and message counters are kept in atomics and surfaced
//! through [`snapshot`]; gauge transitions are also logged at debug level.
//! The wire exporters the deployment may attach (statsd, a hosted error
//! tracker) stay behind this module and the [`ErrorSink`] trait.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, error, trace};

static DEVICE_CLIENTS: AtomicI64 = AtomicI64::new(0);
static CONTROL_CLIENTS: AtomicI64 = AtomicI64::new(0);
static MESSAGES_INGRESS: AtomicU64 = AtomicU64::new(0);
static MESSAGES_EGRESS: AtomicU64 = AtomicU64::new(0);

pub fn add_device_client() {
    let value = DEVICE_CLIENTS.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(gauge = "clients.device", value, "gauge update");
}

pub fn remove_device_client() {
    let value = DEVICE_CLIENTS.fetch_sub(1, Ordering::Relaxed) - 1;
    debug!(gauge = "clients.device", value, "gauge update");
}

pub fn add_control_client() {
    let value = CONTROL_CLIENTS.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(gauge = "clients.control", value, "gauge update");
}

pub fn remove_control_client() {
    let value = CONTROL_CLIENTS.fetch_sub(1, Ordering::Relaxed) - 1;
    debug!(gauge = "clients.control", value, "gauge update");
}

/// Count one message received over the network.
pub fn count_ingress(topic: &str) {
    MESSAGES_INGRESS.fetch_add(1, Ordering::Relaxed);
    trace!(counter = "messages.ingress", topic, "counter update");
}

/// Count one message sent over the network.
pub fn count_egress(topic: &str) {
    MESSAGES_EGRESS.fetch_add(1, Ordering::Relaxed);
    trace!(counter = "messages.egress", topic, "counter update");
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub device_clients: i64,
    pub control_clients: i64,
    pub messages_ingress: u64,
    pub messages_egress: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        device_clients: DEVICE_CLIENTS.load(Ordering::Relaxed),
        control_clients: CONTROL_CLIENTS.load(Ordering::Relaxed),
        messages_ingress: MESSAGES_INGRESS.load(Ordering::Relaxed),
        messages_egress: MESSAGES_EGRESS.load(Ordering::Relaxed),
    }
}

/// Timing for a named code segment.
pub struct Segment {
    start: Instant,
    name: &'static str,
    tag: String,
}

impl Segment {
    pub fn start(name: &'static str, tag: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name,
            tag: tag.into(),
        }
    }

    pub fn end(self) {
        debug!(
            timer = self.name,
            tag = %self.tag,
            millis = self.start.elapsed().as_secs_f64() * 1000.0,
            "segment timing"
        );
    }
}

/// Timer for one upstream device-info request.
pub fn device_info_segment(device_name: &str) -> Segment {
    Segment::start("requests.device_info", format!("device_name:{device_name}"))
}

/// Destination for caught panics and device-reported exceptions.
pub trait ErrorSink: Send + Sync + 'static {
    fn notify(&self, context: &str, error: &str, metadata: &[(&str, String)]);
}

/// Default sink: reports through the log stream.
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn notify(&self, context: &str, error: &str, metadata: &[(&str, String)]) {
        error!(context, ?metadata, "{error}");
    }
}
