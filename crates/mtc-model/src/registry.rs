//! Multi-indexed device collection
//!
//! Insertion order drives probe iteration; uuid and name indices serve
//! lookups. Mutations rebuild the indices before returning, so a reader
//! that takes the registry lock sees either the old or the new state.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::device::Device;
use crate::{ModelError, Result};

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
    by_uuid: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in insertion order (the probe document order)
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// The first non-agent device; targets of empty-name lookups
    pub fn default_device(&self) -> Option<Arc<Device>> {
        self.devices.iter().find(|d| !d.is_agent()).cloned()
    }

    pub fn by_uuid(&self, uuid: &str) -> Option<Arc<Device>> {
        self.by_uuid.get(uuid).map(|&i| Arc::clone(&self.devices[i]))
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Device>> {
        if name.is_empty() {
            return self.default_device();
        }
        self.by_name.get(name).map(|&i| Arc::clone(&self.devices[i]))
    }

    /// uuid first, then name; the default device when `key` is empty
    pub fn find_by_uuid_or_name(&self, key: &str) -> Option<Arc<Device>> {
        if key.is_empty() {
            return self.default_device();
        }
        self.by_uuid(key).or_else(|| self.by_name(key))
    }

    /// Insert a new device. A duplicate uuid is a fatal intake error
    /// surfaced to the caller.
    pub fn add_device(&mut self, device: Arc<Device>) -> Result<()> {
        let uuid = device.uuid();
        if self.by_uuid.contains_key(&uuid) {
            return Err(ModelError::DuplicateUuid(uuid));
        }
        let name = device.name();
        if self.by_name.contains_key(&name) {
            warn!(%name, "device name shadows an existing device");
        }
        self.devices.push(device);
        self.rebuild_indices();
        Ok(())
    }

    /// Swap the device with `uuid` for `device`, keeping its position.
    pub fn replace_device(&mut self, uuid: &str, device: Arc<Device>) -> Result<Arc<Device>> {
        let index = *self
            .by_uuid
            .get(uuid)
            .ok_or_else(|| ModelError::UnknownDevice(uuid.to_string()))?;
        let old = std::mem::replace(&mut self.devices[index], device);
        self.rebuild_indices();
        Ok(old)
    }

    /// Re-key a device in place (the `uuid` adapter command).
    pub fn modify_uuid(&mut self, old_uuid: &str, new_uuid: &str) -> Result<Arc<Device>> {
        let index = *self
            .by_uuid
            .get(old_uuid)
            .ok_or_else(|| ModelError::UnknownDevice(old_uuid.to_string()))?;
        if self.by_uuid.contains_key(new_uuid) {
            return Err(ModelError::DuplicateUuid(new_uuid.to_string()));
        }
        self.devices[index].set_uuid(new_uuid);
        self.rebuild_indices();
        Ok(Arc::clone(&self.devices[index]))
    }

    fn rebuild_indices(&mut self) {
        self.by_uuid.clear();
        self.by_name.clear();
        for (index, device) in self.devices.iter().enumerate() {
            self.by_uuid.insert(device.uuid(), index);
            // first registration wins on name collisions
            self.by_name.entry(device.name()).or_insert(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, name: &str, uuid: &str) -> Arc<Device> {
        Arc::new(Device::new(id, name, uuid))
    }

    #[test]
    fn add_and_find() {
        let mut registry = DeviceRegistry::new();
        registry.add_device(device("d1", "LinuxCNC", "000")).unwrap();
        registry.add_device(device("d2", "Mazak", "111")).unwrap();

        assert_eq!(registry.find_by_uuid_or_name("000").unwrap().name(), "LinuxCNC");
        assert_eq!(registry.find_by_uuid_or_name("Mazak").unwrap().uuid(), "111");
        assert!(registry.find_by_uuid_or_name("missing").is_none());
    }

    #[test]
    fn duplicate_uuid_is_rejected() {
        let mut registry = DeviceRegistry::new();
        registry.add_device(device("d1", "A", "000")).unwrap();
        let err = registry.add_device(device("d2", "B", "000"));
        assert!(matches!(err, Err(ModelError::DuplicateUuid(_))));
    }

    #[test]
    fn empty_key_returns_default_device() {
        let mut registry = DeviceRegistry::new();
        let agent = Arc::new(Device::new("a1", "Agent", "agent-uuid").into_agent());
        registry.add_device(agent).unwrap();
        registry.add_device(device("d1", "LinuxCNC", "000")).unwrap();

        let default = registry.find_by_uuid_or_name("").unwrap();
        assert_eq!(default.uuid(), "000");
    }

    #[test]
    fn uuid_lookup_precedes_name() {
        let mut registry = DeviceRegistry::new();
        // a device whose *name* collides with another device's uuid
        registry.add_device(device("d1", "111", "000")).unwrap();
        registry.add_device(device("d2", "Mazak", "111")).unwrap();

        // uuid match wins
        assert_eq!(registry.find_by_uuid_or_name("111").unwrap().name(), "Mazak");
    }

    #[test]
    fn modify_uuid_rekeys() {
        let mut registry = DeviceRegistry::new();
        registry.add_device(device("d1", "LinuxCNC", "000")).unwrap();

        registry.modify_uuid("000", "ZZZ").unwrap();
        assert!(registry.by_uuid("000").is_none());
        let found = registry.by_uuid("ZZZ").unwrap();
        assert_eq!(found.name(), "LinuxCNC");
        assert_eq!(found.uuid(), "ZZZ");
    }

    #[test]
    fn replace_keeps_position() {
        let mut registry = DeviceRegistry::new();
        registry.add_device(device("d1", "A", "000")).unwrap();
        registry.add_device(device("d2", "B", "111")).unwrap();

        registry
            .replace_device("000", device("d1", "A2", "000"))
            .unwrap();
        assert_eq!(registry.devices()[0].name(), "A2");
        assert_eq!(registry.by_name("A2").unwrap().uuid(), "000");
        assert!(registry.by_name("A").is_none());
    }
}
