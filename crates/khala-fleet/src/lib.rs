//! khala fleet layer
//!
//! Domain logic on top of the broker:
//! - [`FormationMap`]: the concurrent formation/device state store
//! - [`DeviceHandler`]: the device-facing session state machine
//! - [`handlers`]: the domain handlers folding telemetry into snapshots
//! - [`liberator`]: the upstream device-registry lookup

pub mod device;
pub mod formations;
pub mod handlers;
pub mod liberator;

pub use device::DeviceHandler;
pub use formations::{FormationMap, Formations};
pub use liberator::{DeviceInfoFetcher, FetchError, LiberatorClient};
