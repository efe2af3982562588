//! Formation / device state store
//!
//! Two-level map: `formation id → (formation state, device → state bag)`,
//! plus a `device → formation id` reverse index so callers that only know
//! the device can resolve state. Values are opaque to the store; each
//! handler owns the types it puts in.
//!
//! One lock guards the whole structure. [`FormationMap::write`] hands out a
//! guard for compound read-modify-write; single operations can use the
//! one-shot helpers on the outer handle.

use std::any::Any;
use std::collections::HashMap;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Opaque state value; each handler owns the concrete types it stores.
pub type StateValue = Box<dyn Any + Send + Sync>;

type StateBag = HashMap<String, StateValue>;

#[derive(Default)]
struct Formation {
    state: StateBag,
    devices: HashMap<String, StateBag>,
}

/// The locked view of the store. Obtained through [`FormationMap::read`] or
/// [`FormationMap::write`].
#[derive(Default)]
pub struct Formations {
    formations: HashMap<String, Formation>,
    device_index: HashMap<String, String>,
}

impl Formations {
    /// Record which formation a device belongs to. Idempotent; a reconnect
    /// into another formation overwrites the mapping.
    pub fn add_device(&mut self, device_name: &str, formation_id: &str) {
        self.device_index
            .insert(device_name.to_string(), formation_id.to_string());
    }

    /// Reverse lookup; `None` for unknown devices.
    pub fn formation_id(&self, device_name: &str) -> Option<&str> {
        self.device_index.get(device_name).map(String::as_str)
    }

    /// Formation-level state. Creates the formation if absent.
    pub fn put_state<T: Any + Send + Sync>(&mut self, formation_id: &str, key: &str, value: T) {
        self.formations
            .entry(formation_id.to_string())
            .or_default()
            .state
            .insert(key.to_string(), Box::new(value));
    }

    pub fn state<T: Any + Send + Sync>(&self, formation_id: &str, key: &str) -> Option<&T> {
        self.formations
            .get(formation_id)?
            .state
            .get(key)?
            .downcast_ref()
    }

    /// Device-level state. Creates formation and device entries as needed.
    pub fn put_device_state<T: Any + Send + Sync>(
        &mut self,
        formation_id: &str,
        device_name: &str,
        key: &str,
        value: T,
    ) {
        self.formations
            .entry(formation_id.to_string())
            .or_default()
            .devices
            .entry(device_name.to_string())
            .or_default()
            .insert(key.to_string(), Box::new(value));
    }

    /// Device-level state by device name alone, resolved through the
    /// reverse index.
    pub fn device_state<T: Any + Send + Sync>(&self, device_name: &str, key: &str) -> Option<&T> {
        self.device_state_raw(device_name, key)?.downcast_ref()
    }

    pub fn device_state_mut<T: Any + Send + Sync>(
        &mut self,
        device_name: &str,
        key: &str,
    ) -> Option<&mut T> {
        let formation_id = self.device_index.get(device_name)?.clone();
        self.formations
            .get_mut(&formation_id)?
            .devices
            .get_mut(device_name)?
            .get_mut(key)?
            .downcast_mut()
    }

    /// Whether a device has any value under `key`, regardless of its type.
    pub fn has_device_state(&self, device_name: &str, key: &str) -> bool {
        self.device_state_raw(device_name, key).is_some()
    }

    pub fn delete_device_state(
        &mut self,
        formation_id: &str,
        device_name: &str,
        key: &str,
    ) -> Option<StateValue> {
        self.formations
            .get_mut(formation_id)?
            .devices
            .get_mut(device_name)?
            .remove(key)
    }

    fn device_state_raw(&self, device_name: &str, key: &str) -> Option<&StateValue> {
        let formation_id = self.device_index.get(device_name)?;
        self.formations
            .get(formation_id)?
            .devices
            .get(device_name)?
            .get(key)
    }
}

/// Thread-safe handle to the store.
#[derive(Default)]
pub struct FormationMap {
    inner: RwLock<Formations>,
}

impl FormationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Formations> {
        self.inner.read()
    }

    /// Writer guard. Handlers performing compound updates hold this for the
    /// duration of the update.
    pub fn write(&self) -> RwLockWriteGuard<'_, Formations> {
        self.inner.write()
    }

    pub fn add_device(&self, device_name: &str, formation_id: &str) {
        self.write().add_device(device_name, formation_id);
    }

    pub fn formation_id(&self, device_name: &str) -> Option<String> {
        self.read().formation_id(device_name).map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_index_resolves_device_state() {
        let map = FormationMap::new();
        map.add_device("1.marsara", "f-1");
        map.write().put_device_state("f-1", "1.marsara", "counter", 7u32);

        let guard = map.read();
        assert_eq!(guard.device_state::<u32>("1.marsara", "counter"), Some(&7));
        assert_eq!(guard.formation_id("1.marsara"), Some("f-1"));
    }

    #[test]
    fn put_device_state_creates_formation_eagerly() {
        let map = FormationMap::new();
        map.add_device("dev", "fresh");
        map.write().put_device_state("fresh", "dev", "k", "v");
        assert!(map.read().has_device_state("dev", "k"));
    }

    #[test]
    fn typed_access_rejects_wrong_type() {
        let map = FormationMap::new();
        map.add_device("dev", "f");
        map.write().put_device_state("f", "dev", "k", 1u32);
        assert!(map.read().device_state::<String>("dev", "k").is_none());
    }

    #[test]
    fn delete_returns_value() {
        let map = FormationMap::new();
        map.add_device("dev", "f");
        map.write().put_device_state("f", "dev", "k", 5i64);

        let taken = map.write().delete_device_state("f", "dev", "k");
        assert!(taken.is_some());
        assert!(!map.read().has_device_state("dev", "k"));
        assert!(map.write().delete_device_state("f", "dev", "k").is_none());
    }

    #[test]
    fn formation_state_is_separate_from_device_state() {
        let map = FormationMap::new();
        let mut guard = map.write();
        guard.put_state("f", "shared", 1u8);
        guard.add_device("dev", "f");
        guard.put_device_state("f", "dev", "shared", 2u8);

        assert_eq!(guard.state::<u8>("f", "shared"), Some(&1));
        assert_eq!(guard.device_state::<u8>("dev", "shared"), Some(&2));
    }
}
