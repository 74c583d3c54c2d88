//! Descriptor parsing: MTConnectDevices XML into the typed device model
//!
//! Accepts probe-format documents (the same shape the XML printer emits), so
//! the versioned-backup round trip and upstream-agent probes go through one
//! parser. Unknown elements (Configuration, References, ...) are skipped
//! whole.

use std::collections::HashMap;
use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::component::{Component, Composition, Description};
use crate::data_item::{DataItem, Filter};
use crate::device::Device;
use crate::schema::SchemaVersion;
use crate::{ModelError, Result};

#[derive(Debug, PartialEq)]
enum Ctx {
    Devices,
    Device,
    Description,
    Components,
    Component,
    DataItems,
    DataItem,
    Constraints,
    ConstraintValue,
    Filters,
    Filter(String),
    Compositions,
}

#[derive(Default)]
struct PendingDataItem {
    attrs: HashMap<String, String>,
    constraint_values: Vec<String>,
    filters: Vec<Filter>,
}

/// Parse an MTConnectDevices document. Returns the schema version declared
/// by the document (attribute or namespace) and the devices in order.
pub fn parse_devices(xml: &str) -> Result<(Option<SchemaVersion>, Vec<Arc<Device>>)> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut schema_version: Option<SchemaVersion> = None;
    let mut devices: Vec<Arc<Device>> = Vec::new();
    let mut device: Option<Arc<Device>> = None;
    let mut component_stack: Vec<usize> = Vec::new();
    let mut ctx: Vec<Ctx> = Vec::new();
    let mut pending: Option<PendingDataItem> = None;
    let mut filter_text = String::new();
    let mut skip_buf = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = element_name(&e);
                match name.as_str() {
                    "MTConnectDevices" => {
                        schema_version = schema_version_from(&e);
                    }
                    "Devices" => ctx.push(Ctx::Devices),
                    "Device" | "Agent" if device.is_none() => {
                        device = Some(Arc::new(start_device(&e, &name)?));
                        component_stack.push(0);
                        ctx.push(Ctx::Device);
                    }
                    "Description" => {
                        if let Some(dev) = &device {
                            dev.set_description(description_from(&e));
                        }
                        ctx.push(Ctx::Description);
                    }
                    "DataItems" => ctx.push(Ctx::DataItems),
                    "DataItem" => {
                        pending = Some(PendingDataItem {
                            attrs: attributes_of(&e),
                            ..Default::default()
                        });
                        ctx.push(Ctx::DataItem);
                    }
                    "Constraints" if pending.is_some() => ctx.push(Ctx::Constraints),
                    "Value" if ctx.last() == Some(&Ctx::Constraints) => {
                        ctx.push(Ctx::ConstraintValue)
                    }
                    "Filters" if pending.is_some() => ctx.push(Ctx::Filters),
                    "Filter" if ctx.last() == Some(&Ctx::Filters) => {
                        let attrs = attributes_of(&e);
                        filter_text.clear();
                        ctx.push(Ctx::Filter(
                            attrs.get("type").cloned().unwrap_or_default(),
                        ));
                    }
                    "Compositions" => ctx.push(Ctx::Compositions),
                    "Composition" if ctx.last() == Some(&Ctx::Compositions) => {
                        add_composition(&device, &component_stack, &e);
                        // skip Description and other children of the composition
                        let end = e.to_end().into_owned();
                        reader.read_to_end_into(end.name(), &mut skip_buf)?;
                    }
                    "Components" => ctx.push(Ctx::Components),
                    _ if ctx.last() == Some(&Ctx::Components) && device.is_some() => {
                        let index = start_component(&device, &component_stack, &e, &name);
                        component_stack.push(index);
                        ctx.push(Ctx::Component);
                    }
                    _ => {
                        // Configuration, References, Source: not modeled
                        debug!(element = %name, "skipping unmodeled element");
                        let end = e.to_end().into_owned();
                        reader.read_to_end_into(end.name(), &mut skip_buf)?;
                    }
                }
            }
            Event::Empty(e) => {
                let name = element_name(&e);
                match name.as_str() {
                    "DataItem" => {
                        let item = PendingDataItem {
                            attrs: attributes_of(&e),
                            ..Default::default()
                        };
                        finish_data_item(&device, &component_stack, item)?;
                    }
                    "Composition" if ctx.last() == Some(&Ctx::Compositions) => {
                        add_composition(&device, &component_stack, &e);
                    }
                    "Filter" if ctx.last() == Some(&Ctx::Filters) => {
                        let attrs = attributes_of(&e);
                        let filter_type = attrs.get("type").map(String::as_str).unwrap_or("");
                        if let (Some(item), Some(filter)) =
                            (pending.as_mut(), parse_filter(filter_type, ""))
                        {
                            item.filters.push(filter);
                        }
                    }
                    "Description" => {
                        if let Some(dev) = &device {
                            dev.set_description(description_from(&e));
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                match ctx.last() {
                    Some(Ctx::ConstraintValue) => {
                        if let Some(item) = pending.as_mut() {
                            item.constraint_values.push(text);
                        }
                    }
                    Some(Ctx::Filter(_)) => filter_text.push_str(&text),
                    Some(Ctx::Description) => {
                        if let Some(dev) = &device {
                            let mut description = dev.description();
                            description.value = Some(text);
                            dev.set_description(description);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => match ctx.pop() {
                Some(Ctx::Device) => {
                    if let Some(dev) = device.take() {
                        dev.compute_paths();
                        dev.attach_items();
                        devices.push(dev);
                    }
                    component_stack.clear();
                }
                Some(Ctx::Component) => {
                    component_stack.pop();
                }
                Some(Ctx::DataItem) => {
                    if let Some(item) = pending.take() {
                        finish_data_item(&device, &component_stack, item)?;
                    }
                }
                Some(Ctx::Filter(filter_type)) => {
                    if let (Some(item), Some(filter)) =
                        (pending.as_mut(), parse_filter(&filter_type, &filter_text))
                    {
                        item.filters.push(filter);
                    }
                    filter_text.clear();
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if devices.is_empty() {
        return Err(ModelError::InvalidDescriptor(
            "document contains no devices".to_string(),
        ));
    }
    Ok((schema_version, devices))
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attributes_of(e: &BytesStart<'_>) -> HashMap<String, String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .filter_map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
            let value = a.unescape_value().ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

fn schema_version_from(e: &BytesStart<'_>) -> Option<SchemaVersion> {
    let attrs = attributes_of(e);
    if let Some(v) = attrs.get("schemaVersion").and_then(|v| SchemaVersion::parse(v)) {
        return Some(v);
    }
    attrs
        .iter()
        .filter(|(k, _)| k.as_str() == "xmlns" || k.starts_with("xmlns:"))
        .find_map(|(_, v)| SchemaVersion::from_namespace(v))
}

fn start_device(e: &BytesStart<'_>, element: &str) -> Result<Device> {
    let attrs = attributes_of(e);
    let id = attrs
        .get("id")
        .cloned()
        .ok_or_else(|| ModelError::MissingAttribute {
            element: element.to_string(),
            attribute: "id".into(),
        })?;
    let uuid = attrs
        .get("uuid")
        .cloned()
        .ok_or_else(|| ModelError::MissingAttribute {
            element: element.to_string(),
            attribute: "uuid".into(),
        })?;
    let name = attrs.get("name").cloned().unwrap_or_else(|| id.clone());

    let mut device = Device::new(id, name, uuid)
        .with_preserve_uuid(attrs.get("preserveUuid").map(|v| v == "true").unwrap_or(false))
        .with_mtconnect_version(attrs.get("mtconnectVersion").cloned());
    if element == "Agent" {
        device = device.into_agent();
    }
    if let Some(native) = attrs.get("nativeName") {
        device.set_native_name(native.clone());
    }
    Ok(device)
}

fn description_from(e: &BytesStart<'_>) -> Description {
    let attrs = attributes_of(e);
    Description {
        manufacturer: attrs.get("manufacturer").cloned(),
        model: attrs.get("model").cloned(),
        serial_number: attrs.get("serialNumber").cloned(),
        station: attrs.get("station").cloned(),
        value: None,
    }
}

fn start_component(
    device: &Option<Arc<Device>>,
    stack: &[usize],
    e: &BytesStart<'_>,
    component_type: &str,
) -> usize {
    let attrs = attributes_of(e);
    let device = device.as_ref().expect("component outside a device");
    let parent = *stack.last().unwrap_or(&0);
    let id = attrs
        .get("id")
        .cloned()
        .unwrap_or_else(|| format!("{}_{}", component_type.to_lowercase(), device.component_count()));
    device.add_component(
        parent,
        Component::new(id, component_type, attrs.get("name").cloned(), None),
    )
}

fn add_composition(device: &Option<Arc<Device>>, stack: &[usize], e: &BytesStart<'_>) {
    let attrs = attributes_of(e);
    if let (Some(device), Some(&index)) = (device.as_ref(), stack.last()) {
        let composition = Composition {
            id: attrs.get("id").cloned().unwrap_or_default(),
            composition_type: attrs.get("type").cloned().unwrap_or_default(),
            name: attrs.get("name").cloned(),
        };
        device.add_composition(index, composition);
    }
}

fn finish_data_item(
    device: &Option<Arc<Device>>,
    stack: &[usize],
    item: PendingDataItem,
) -> Result<()> {
    let device = device
        .as_ref()
        .ok_or_else(|| ModelError::InvalidDescriptor("DataItem outside a device".into()))?;
    let mut data_item = DataItem::make(&item.attrs)?;
    // a single constrained value is a constant
    if item.constraint_values.len() == 1 {
        data_item.set_constant_value(item.constraint_values.into_iter().next().unwrap());
    }
    for filter in item.filters {
        data_item.add_filter(filter);
    }
    let component = *stack.last().unwrap_or(&0);
    device.add_data_item_to(component, data_item);
    Ok(())
}

fn parse_filter(filter_type: &str, text: &str) -> Option<Filter> {
    match filter_type {
        "MINIMUM_DELTA" => text.trim().parse().ok().map(Filter::MinimumDelta),
        "PERIOD" => text.trim().parse().ok().map(Filter::Period),
        "DUPLICATE" => Some(Filter::Duplicate),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_item::{Category, Representation};

    const DESCRIPTOR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MTConnectDevices xmlns="urn:mtconnect.org:MTConnectDevices:1.7">
  <Header creationTime="2021-01-01T00:00:00Z" instanceId="1" bufferSize="131072" version="1.7"/>
  <Devices>
    <Device id="d" name="LinuxCNC" uuid="000">
      <Description manufacturer="LinuxCNC">Test device</Description>
      <DataItems>
        <DataItem id="d_avail" type="AVAILABILITY" category="EVENT"/>
      </DataItems>
      <Components>
        <Controller id="ct" name="Controller">
          <Components>
            <Path id="pt" name="path">
              <DataItems>
                <DataItem id="cn2" name="line" type="LINE" category="EVENT"/>
                <DataItem id="v1" name="vars" type="VARIABLE" category="EVENT" representation="DATA_SET"/>
                <DataItem id="w1" name="wpo" type="WORK_OFFSET" category="EVENT" representation="TABLE"/>
              </DataItems>
            </Path>
          </Components>
        </Controller>
        <Axes id="ax" name="Axes">
          <Components>
            <Linear id="x" name="X">
              <DataItems>
                <DataItem id="xp" name="Xpos" type="POSITION" subType="ACTUAL" category="SAMPLE" units="MILLIMETER">
                  <Filters>
                    <Filter type="MINIMUM_DELTA">0.5</Filter>
                  </Filters>
                </DataItem>
                <DataItem id="xm" name="Xmode" type="AXIS_STATE" category="EVENT">
                  <Constraints>
                    <Value>HOME</Value>
                  </Constraints>
                </DataItem>
              </DataItems>
              <Compositions>
                <Composition id="xmotor" type="MOTOR" name="motor_name"/>
              </Compositions>
            </Linear>
          </Components>
        </Axes>
      </Components>
    </Device>
  </Devices>
</MTConnectDevices>"#;

    #[test]
    fn parses_schema_version_from_namespace() {
        let (version, _) = parse_devices(DESCRIPTOR).unwrap();
        assert_eq!(version, Some(SchemaVersion::V1_7));
    }

    #[test]
    fn parses_device_tree() {
        let (_, devices) = parse_devices(DESCRIPTOR).unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.uuid(), "000");
        assert_eq!(device.name(), "LinuxCNC");
        assert_eq!(device.description().manufacturer.as_deref(), Some("LinuxCNC"));
        assert_eq!(device.description().value.as_deref(), Some("Test device"));
        // root + Controller + Path + Axes + Linear
        assert_eq!(device.component_count(), 5);
    }

    #[test]
    fn parses_data_items_with_paths() {
        let (_, devices) = parse_devices(DESCRIPTOR).unwrap();
        let device = &devices[0];

        let line = device.data_item_by_name("line").unwrap();
        assert_eq!(line.id(), "cn2");
        assert_eq!(line.category(), Category::Event);
        assert_eq!(line.path(), "Controller[Controller]/Path[path]");

        let vars = device.data_item_by_name("vars").unwrap();
        assert_eq!(vars.representation(), Representation::DataSet);

        let wpo = device.data_item_by_name("wpo").unwrap();
        assert!(wpo.is_table());
    }

    #[test]
    fn parses_constraints_and_filters() {
        let (_, devices) = parse_devices(DESCRIPTOR).unwrap();
        let device = &devices[0];

        let xmode = device.data_item_by_name("Xmode").unwrap();
        assert_eq!(xmode.constant_value(), Some("HOME"));

        let xpos = device.data_item_by_name("Xpos").unwrap();
        assert_eq!(xpos.filters(), &[Filter::MinimumDelta(0.5)]);
        assert_eq!(xpos.units(), Some("MILLIMETER"));
    }

    #[test]
    fn parses_compositions() {
        let (_, devices) = parse_devices(DESCRIPTOR).unwrap();
        let device = &devices[0];
        device.with_components(|components| {
            let linear = components.iter().find(|c| c.id == "x").unwrap();
            assert_eq!(linear.compositions.len(), 1);
            assert_eq!(linear.compositions[0].composition_type, "MOTOR");
            assert_eq!(linear.compositions[0].name.as_deref(), Some("motor_name"));
        });
    }

    #[test]
    fn agent_element_marks_agent_device() {
        let xml = r#"<MTConnectDevices schemaVersion="2.0">
            <Devices>
              <Agent id="a" name="Agent" uuid="agent-1">
                <DataItems>
                  <DataItem id="agent_avail" type="AVAILABILITY" category="EVENT"/>
                </DataItems>
              </Agent>
              <Device id="d" name="M" uuid="001"/>
            </Devices>
          </MTConnectDevices>"#;
        let (version, devices) = parse_devices(xml).unwrap();
        assert_eq!(version, Some(SchemaVersion::V2_0));
        assert!(devices[0].is_agent());
        assert!(!devices[1].is_agent());
    }

    #[test]
    fn missing_uuid_is_an_error() {
        let xml = r#"<MTConnectDevices><Devices><Device id="d" name="M"/></Devices></MTConnectDevices>"#;
        assert!(parse_devices(xml).is_err());
    }

    #[test]
    fn empty_document_is_an_error() {
        let xml = r#"<MTConnectDevices><Devices/></MTConnectDevices>"#;
        assert!(parse_devices(xml).is_err());
    }
}
