//! The synthetic agent device
//!
//! Represents the agent itself in the device model: availability, the
//! device_added/changed/removed event items, and one component per adapter
//! carrying its connection_status and version items. The uuid is derived
//! deterministically from the advertised `address:port` so it is stable
//! across restarts.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use mtc_model::{Component, DataItem, Device};

pub const AVAILABILITY_ID: &str = "agent_avail";
pub const DEVICE_ADDED_ID: &str = "device_added";
pub const DEVICE_CHANGED_ID: &str = "device_changed";
pub const DEVICE_REMOVED_ID: &str = "device_removed";

/// Build the agent device for the advertised REST address.
pub fn create_agent_device(address: &str) -> Arc<Device> {
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_DNS, address.as_bytes()).to_string();
    let first_segment = uuid.split('-').next().unwrap_or(&uuid).to_string();
    let id = format!("agent_{first_segment}");

    let device = Arc::new(Device::new(id.clone(), "Agent", uuid).into_agent());

    let event = |item_id: &str, type_name: &str| -> DataItem {
        let attrs: HashMap<String, String> = [
            ("id".to_string(), item_id.to_string()),
            ("type".to_string(), type_name.to_string()),
            ("category".to_string(), "EVENT".to_string()),
        ]
        .into();
        DataItem::make(&attrs).expect("static agent data item")
    };

    device.add_data_item(event(AVAILABILITY_ID, "AVAILABILITY"));
    device.add_data_item(event(DEVICE_ADDED_ID, "DEVICE_ADDED"));
    device.add_data_item(event(DEVICE_CHANGED_ID, "DEVICE_CHANGED"));
    device.add_data_item(event(DEVICE_REMOVED_ID, "DEVICE_REMOVED"));

    device.add_component(
        0,
        Component::new(format!("{id}_adapters"), "Adapters", None, None),
    );

    device.compute_paths();
    device.attach_items();
    device
}

/// Register an adapter: a component under Adapters with the per-adapter
/// connection and version data items.
pub fn add_adapter(device: &Arc<Device>, identity: &str) {
    let prefix = sanitize(identity);
    if device
        .data_item_by_name(&format!("{prefix}_connection_status"))
        .is_some()
    {
        return;
    }

    let adapters = device.with_components(|components| {
        components
            .iter()
            .position(|c| c.component_type == "Adapters")
            .unwrap_or(0)
    });
    let adapter = device.add_component(
        adapters,
        Component::new(prefix.clone(), "Adapter", Some(identity.to_string()), None),
    );

    let event = |item_id: String, type_name: &str| -> DataItem {
        let attrs: HashMap<String, String> = [
            ("id".to_string(), item_id),
            ("type".to_string(), type_name.to_string()),
            ("category".to_string(), "EVENT".to_string()),
        ]
        .into();
        DataItem::make(&attrs).expect("static adapter data item")
    };

    device.add_data_item_to(
        adapter,
        event(format!("{prefix}_connection_status"), "CONNECTION_STATUS"),
    );
    device.add_data_item_to(
        adapter,
        event(
            format!("{prefix}_adapter_software_version"),
            "ADAPTER_SOFTWARE_VERSION",
        ),
    );
    device.add_data_item_to(
        adapter,
        event(format!("{prefix}_mtconnect_version"), "MTCONNECT_VERSION"),
    );
    let mut uri = event(format!("{prefix}_adapter_uri"), "ADAPTER_URI");
    uri.set_constant_value(identity);
    device.add_data_item_to(adapter, uri);

    device.compute_paths();
    device.attach_items();
}

/// Look up an adapter's connection_status item by identity.
pub fn connection_status(device: &Arc<Device>, identity: &str) -> Option<Arc<DataItem>> {
    device.data_item_by_name(&format!("{}_connection_status", sanitize(identity)))
}

/// Adapter identities become id-safe prefixes ("10.0.0.5:7878" ->
/// "_10_0_0_5_7878").
pub fn sanitize(identity: &str) -> String {
    let mut out = String::with_capacity(identity.len() + 1);
    if identity
        .chars()
        .next()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
    {
        out.push('_');
    }
    for c in identity.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    out
}
