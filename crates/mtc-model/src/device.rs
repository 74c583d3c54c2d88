//! Devices: the root of the component tree
//!
//! A device is built by the descriptor parser (or the agent-device factory),
//! then shared as `Arc<Device>`. Identity fields that adapter commands and
//! `receiveDevice` re-key sit behind locks; the component arena is only
//! appended to (device verification, agent-device adapter registration),
//! never restructured.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::component::{Component, Description};
use crate::data_item::DataItem;

/// Device-level data item types required by intake
pub const TYPE_AVAILABILITY: &str = "AVAILABILITY";
pub const TYPE_ASSET_CHANGED: &str = "ASSET_CHANGED";
pub const TYPE_ASSET_REMOVED: &str = "ASSET_REMOVED";
pub const TYPE_ASSET_COUNT: &str = "ASSET_COUNT";

/// Component facts a printer or sink needs about an observation's owner
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub id: String,
    pub component_type: String,
    pub name: Option<String>,
}

pub struct Device {
    uuid: RwLock<String>,
    name: RwLock<String>,
    native_name: RwLock<Option<String>>,
    description: RwLock<Description>,
    preserve_uuid: bool,
    is_agent: bool,
    mtconnect_version: Option<String>,
    components: RwLock<Vec<Component>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("uuid", &self.uuid())
            .field("name", &self.name())
            .field("is_agent", &self.is_agent)
            .finish()
    }
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, uuid: impl Into<String>) -> Self {
        let name = name.into();
        let root = Component::new(id, "Device", Some(name.clone()), None);
        Self {
            uuid: RwLock::new(uuid.into()),
            name: RwLock::new(name),
            native_name: RwLock::new(None),
            description: RwLock::new(Description::default()),
            preserve_uuid: false,
            is_agent: false,
            mtconnect_version: None,
            components: RwLock::new(vec![root]),
        }
    }

    /// Mark as the synthetic agent device ("Agent" element)
    pub fn into_agent(mut self) -> Self {
        self.is_agent = true;
        self.components.get_mut()[0].component_type = "Agent".to_string();
        self
    }

    pub fn with_preserve_uuid(mut self, preserve: bool) -> Self {
        self.preserve_uuid = preserve;
        self
    }

    pub fn with_mtconnect_version(mut self, version: Option<String>) -> Self {
        self.mtconnect_version = version;
        self
    }

    // --- identity --------------------------------------------------------

    pub fn id(&self) -> String {
        self.components.read()[0].id.clone()
    }

    pub fn uuid(&self) -> String {
        self.uuid.read().clone()
    }

    pub fn set_uuid(&self, uuid: impl Into<String>) {
        *self.uuid.write() = uuid.into();
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn native_name(&self) -> Option<String> {
        self.native_name.read().clone()
    }

    pub fn set_native_name(&self, name: impl Into<String>) {
        *self.native_name.write() = Some(name.into());
    }

    pub fn preserve_uuid(&self) -> bool {
        self.preserve_uuid
    }

    pub fn is_agent(&self) -> bool {
        self.is_agent
    }

    pub fn mtconnect_version(&self) -> Option<&str> {
        self.mtconnect_version.as_deref()
    }

    // --- description (mutable via adapter commands) ----------------------

    pub fn description(&self) -> Description {
        self.description.read().clone()
    }

    pub fn set_description(&self, description: Description) {
        *self.description.write() = description;
    }

    pub fn set_manufacturer(&self, value: impl Into<String>) {
        self.description.write().manufacturer = Some(value.into());
    }

    pub fn set_station(&self, value: impl Into<String>) {
        self.description.write().station = Some(value.into());
    }

    pub fn set_serial_number(&self, value: impl Into<String>) {
        self.description.write().serial_number = Some(value.into());
    }

    pub fn set_description_value(&self, value: impl Into<String>) {
        self.description.write().value = Some(value.into());
    }

    // --- component arena -------------------------------------------------

    /// Append a component under `parent` (the device root is index 0).
    pub fn add_component(&self, parent: usize, mut component: Component) -> usize {
        let mut components = self.components.write();
        let index = components.len();
        component.parent = Some(parent);
        components[parent].children.push(index);
        components.push(component);
        index
    }

    /// Attach a freshly built data item to a component, fixing its back
    /// references, and return the shared handle.
    pub fn add_data_item_to(&self, component: usize, mut data_item: DataItem) -> Arc<DataItem> {
        let mut components = self.components.write();
        data_item.set_component_id(components[component].id.clone());
        let item = Arc::new(data_item);
        components[component].data_items.push(Arc::clone(&item));
        drop(components);
        self.set_item_path(&item);
        item
    }

    /// Attach to the device root. Used by device verification.
    pub fn add_data_item(&self, data_item: DataItem) -> Arc<DataItem> {
        self.add_data_item_to(0, data_item)
    }

    /// Carry an existing (already shared) data item forward into this device.
    /// Used by the device-replace path so buffered observations keep their
    /// bindings.
    pub fn adopt_data_item(&self, data_item: Arc<DataItem>) {
        self.components.write()[0]
            .data_items
            .push(Arc::clone(&data_item));
        self.set_item_path(&data_item);
    }

    pub fn add_composition(&self, component: usize, composition: crate::component::Composition) {
        self.components.write()[component]
            .compositions
            .push(composition);
    }

    fn set_item_path(&self, item: &Arc<DataItem>) {
        let components = self.components.read();
        let index = components
            .iter()
            .position(|c| c.id == item.component_id())
            .unwrap_or(0);
        item.set_path(self.path_of_index(&components, index));
    }

    fn path_of_index(&self, components: &[Component], mut index: usize) -> String {
        let mut segments = Vec::new();
        // the device root is not part of the path
        while index != 0 {
            segments.push(components[index].path_segment());
            index = components[index].parent.unwrap_or(0);
        }
        segments.reverse();
        segments.join("/")
    }

    /// Point every data item's device back reference at this device.
    /// Idempotent; called whenever items were added after the device was
    /// shared (verification, adapter registration, carry-forward).
    pub fn attach_items(self: &Arc<Self>) {
        for item in self.data_items() {
            item.set_device(Arc::downgrade(self));
        }
    }

    /// Recompute the cached component path of every data item. Called once
    /// when the parser finishes the device.
    pub fn compute_paths(&self) {
        let components = self.components.read();
        for (index, component) in components.iter().enumerate() {
            let path = self.path_of_index(&components, index);
            for item in &component.data_items {
                item.set_path(path.clone());
            }
        }
    }

    pub fn component_count(&self) -> usize {
        self.components.read().len()
    }

    /// Snapshot of the component facts for an observation's owner
    pub fn component_info(&self, component_id: &str) -> Option<ComponentInfo> {
        self.components
            .read()
            .iter()
            .find(|c| c.id == component_id)
            .map(|c| ComponentInfo {
                id: c.id.clone(),
                component_type: c.component_type.clone(),
                name: c.name.clone(),
            })
    }

    /// Run `f` over the arena without cloning it
    pub fn with_components<R>(&self, f: impl FnOnce(&[Component]) -> R) -> R {
        f(&self.components.read())
    }

    // --- data items ------------------------------------------------------

    /// All data items of the device, in component order
    pub fn data_items(&self) -> Vec<Arc<DataItem>> {
        self.components
            .read()
            .iter()
            .flat_map(|c| c.data_items.iter().cloned())
            .collect()
    }

    /// Find by id first, then by adapter-facing name
    pub fn data_item_by_name(&self, name: &str) -> Option<Arc<DataItem>> {
        let components = self.components.read();
        for component in components.iter() {
            for item in &component.data_items {
                if item.id() == name {
                    return Some(Arc::clone(item));
                }
            }
        }
        for component in components.iter() {
            for item in &component.data_items {
                if item.source_name() == name || item.name() == Some(name) {
                    return Some(Arc::clone(item));
                }
            }
        }
        None
    }

    fn data_item_by_type(&self, type_name: &str) -> Option<Arc<DataItem>> {
        self.components
            .read()
            .iter()
            .flat_map(|c| c.data_items.iter())
            .find(|item| item.type_name() == type_name)
            .cloned()
    }

    pub fn availability(&self) -> Option<Arc<DataItem>> {
        self.data_item_by_type(TYPE_AVAILABILITY)
    }

    pub fn asset_changed(&self) -> Option<Arc<DataItem>> {
        self.data_item_by_type(TYPE_ASSET_CHANGED)
    }

    pub fn asset_removed(&self) -> Option<Arc<DataItem>> {
        self.data_item_by_type(TYPE_ASSET_REMOVED)
    }

    pub fn asset_count(&self) -> Option<Arc<DataItem>> {
        self.data_item_by_type(TYPE_ASSET_COUNT)
    }

    // --- structural diff -------------------------------------------------

    /// Deep structural comparison, used by the device-replace path to decide
    /// whether a reloaded descriptor actually changed anything. Runtime state
    /// (sequences, calibration, claimed adapters) is not part of identity.
    pub fn same_structure(&self, other: &Device) -> bool {
        if self.uuid() != other.uuid()
            || self.name() != other.name()
            || self.native_name() != other.native_name()
            || self.description() != other.description()
        {
            return false;
        }

        let mine = self.components.read();
        let theirs = other.components.read();
        if mine.len() != theirs.len() {
            return false;
        }
        for (a, b) in mine.iter().zip(theirs.iter()) {
            if !a.same_structure(b) {
                return false;
            }
            if a.data_items.len() != b.data_items.len() {
                return false;
            }
            for (x, y) in a.data_items.iter().zip(b.data_items.iter()) {
                if !definition_eq(x, y) {
                    return false;
                }
            }
        }
        true
    }
}

fn definition_eq(a: &DataItem, b: &DataItem) -> bool {
    a.id() == b.id()
        && a.name() == b.name()
        && a.type_name() == b.type_name()
        && a.sub_type() == b.sub_type()
        && a.category() == b.category()
        && a.representation() == b.representation()
        && a.units() == b.units()
        && a.constant_value() == b.constant_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_item::DataItem;
    use std::collections::HashMap;

    fn data_item(id: &str, type_name: &str, name: Option<&str>) -> DataItem {
        let mut attrs: HashMap<String, String> = [
            ("id".to_string(), id.to_string()),
            ("type".to_string(), type_name.to_string()),
            ("category".to_string(), "EVENT".to_string()),
        ]
        .into();
        if let Some(n) = name {
            attrs.insert("name".to_string(), n.to_string());
        }
        DataItem::make(&attrs).unwrap()
    }

    fn sample_device() -> Device {
        let device = Device::new("d1", "LinuxCNC", "000");
        let controller = device.add_component(
            0,
            Component::new("ct1", "Controller", Some("Controller".into()), None),
        );
        let path = device.add_component(controller, Component::new("pt1", "Path", None, None));
        device.add_data_item_to(path, data_item("cn2", "LINE", Some("line")));
        device.add_data_item(data_item("d1_avail", "AVAILABILITY", None));
        device
    }

    #[test]
    fn paths_exclude_device_root() {
        let device = sample_device();
        let line = device.data_item_by_name("line").unwrap();
        assert_eq!(line.path(), "Controller[Controller]/Path");
        let avail = device.availability().unwrap();
        assert_eq!(avail.path(), "");
    }

    #[test]
    fn finds_by_id_then_name() {
        let device = sample_device();
        assert_eq!(device.data_item_by_name("cn2").unwrap().id(), "cn2");
        assert_eq!(device.data_item_by_name("line").unwrap().id(), "cn2");
        assert!(device.data_item_by_name("nope").is_none());
    }

    #[test]
    fn device_level_type_lookups() {
        let device = sample_device();
        assert_eq!(device.availability().unwrap().id(), "d1_avail");
        assert!(device.asset_changed().is_none());
    }

    #[test]
    fn structural_equality_ignores_runtime_state() {
        let a = sample_device();
        let b = sample_device();
        assert!(a.same_structure(&b));

        // calibration is runtime state, not structure
        a.data_item_by_name("line")
            .unwrap()
            .set_conversion(crate::data_item::UnitConversion::new(2.0, 0.0));
        assert!(a.same_structure(&b));

        // a new data item is structure
        b.add_data_item(data_item("extra", "PROGRAM", None));
        assert!(!a.same_structure(&b));
    }

    #[test]
    fn uuid_rekey() {
        let device = sample_device();
        assert_eq!(device.uuid(), "000");
        device.set_uuid("ZZZ");
        assert_eq!(device.uuid(), "ZZZ");
    }
}
