//! Domain handlers
//!
//! Each module folds one slice of device telemetry into the formation store
//! and republishes snapshots on `matriarch/…` topics. Every module exposes a
//! `register` entry that wraps its handler in a broker worker and subscribes
//! its patterns; [`register_all`] is the fixed registry the daemon runs.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use khala_broker::{Broker, ErrorSink};

use crate::formations::FormationMap;

pub mod device_info;
pub mod exception;
pub mod ping;
pub mod stations;
pub mod up;

/// Register every domain handler.
pub fn register_all(
    broker: &Arc<Broker>,
    formations: &Arc<FormationMap>,
    error_sink: &Arc<dyn ErrorSink>,
) {
    device_info::register(broker, formations);
    exception::register(broker, formations, error_sink);
    ping::register(broker, formations);
    stations::register(broker, formations);
    up::register(broker, formations);
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Round half-up to `places` decimal places.
pub(crate) fn round_to(f: f64, places: i32) -> f64 {
    let shift = 10f64.powi(places);
    (f * shift + 0.5).floor() / shift
}

/// Round half-up to the nearest integer.
pub(crate) fn round_i64(f: f64) -> i64 {
    (f + 0.5).floor() as i64
}
