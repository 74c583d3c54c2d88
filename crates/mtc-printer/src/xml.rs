//! XML printer: MTConnectDevices / MTConnectStreams / MTConnectAssets /
//! MTConnectError documents

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use mtc_model::{
    Asset, Category, Component, Device, Filter, Observation, Representation, SchemaVersion, Value,
};

use crate::{DocumentHeader, Printer};

pub struct XmlPrinter {
    pretty: bool,
    schema_version: RwLock<SchemaVersion>,
    model_change_time: RwLock<Option<String>>,
}

impl XmlPrinter {
    pub fn new(pretty: bool) -> Self {
        Self {
            pretty,
            schema_version: RwLock::new(SchemaVersion::DEFAULT),
            model_change_time: RwLock::new(None),
        }
    }

    fn writer(&self) -> Writer<Vec<u8>> {
        if self.pretty {
            Writer::new_with_indent(Vec::new(), b' ', 2)
        } else {
            Writer::new(Vec::new())
        }
    }

    fn namespace(&self, document: &str) -> String {
        format!(
            "urn:mtconnect.org:MTConnect{document}:{}",
            self.schema_version.read()
        )
    }

    fn write_header(&self, writer: &mut Writer<Vec<u8>>, header: &DocumentHeader, streams: bool) {
        let mut element = BytesStart::new("Header");
        element.push_attribute((
            "creationTime",
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .as_str(),
        ));
        element.push_attribute(("sender", header.sender.as_str()));
        element.push_attribute(("instanceId", header.instance_id.to_string().as_str()));
        element.push_attribute(("version", self.schema_version.read().to_string().as_str()));
        element.push_attribute(("bufferSize", header.buffer_size.to_string().as_str()));
        element.push_attribute((
            "assetBufferSize",
            header.asset_buffer_size.to_string().as_str(),
        ));
        element.push_attribute(("assetCount", header.asset_count.to_string().as_str()));
        if streams {
            element.push_attribute(("firstSequence", header.first_sequence.to_string().as_str()));
            element.push_attribute(("lastSequence", header.last_sequence.to_string().as_str()));
            element.push_attribute(("nextSequence", header.next_sequence.to_string().as_str()));
        }
        if let Some(time) = self.model_change_time.read().as_ref() {
            element.push_attribute(("deviceModelChangeTime", time.as_str()));
        }
        write_empty(writer, element);
    }

    fn write_device(&self, writer: &mut Writer<Vec<u8>>, device: &Arc<Device>) {
        let element_name = if device.is_agent() { "Agent" } else { "Device" };
        device.with_components(|components| {
            self.write_component(writer, device, components, 0, element_name);
        });
    }

    fn write_component(
        &self,
        writer: &mut Writer<Vec<u8>>,
        device: &Arc<Device>,
        components: &[Component],
        index: usize,
        element_name: &str,
    ) {
        let component = &components[index];
        let mut element = BytesStart::new(element_name);
        element.push_attribute(("id", component.id.as_str()));
        if index == 0 {
            element.push_attribute(("name", device.name().as_str()));
            element.push_attribute(("uuid", device.uuid().as_str()));
            if let Some(native) = device.native_name() {
                element.push_attribute(("nativeName", native.as_str()));
            }
        } else if let Some(name) = &component.name {
            element.push_attribute(("name", name.as_str()));
        }
        write_start(writer, element);

        if index == 0 {
            let description = device.description();
            let has_attrs = description.manufacturer.is_some()
                || description.model.is_some()
                || description.serial_number.is_some()
                || description.station.is_some()
                || description.value.is_some();
            if has_attrs {
                let mut desc = BytesStart::new("Description");
                if let Some(v) = &description.manufacturer {
                    desc.push_attribute(("manufacturer", v.as_str()));
                }
                if let Some(v) = &description.model {
                    desc.push_attribute(("model", v.as_str()));
                }
                if let Some(v) = &description.serial_number {
                    desc.push_attribute(("serialNumber", v.as_str()));
                }
                if let Some(v) = &description.station {
                    desc.push_attribute(("station", v.as_str()));
                }
                match &description.value {
                    Some(text) => {
                        write_start(writer, desc);
                        write_text(writer, text);
                        write_end(writer, "Description");
                    }
                    None => write_empty(writer, desc),
                }
            }
        }

        if !component.data_items.is_empty() {
            write_start(writer, BytesStart::new("DataItems"));
            for item in &component.data_items {
                self.write_data_item_declaration(writer, item);
            }
            write_end(writer, "DataItems");
        }

        if !component.compositions.is_empty() {
            write_start(writer, BytesStart::new("Compositions"));
            for composition in &component.compositions {
                let mut element = BytesStart::new("Composition");
                element.push_attribute(("id", composition.id.as_str()));
                element.push_attribute(("type", composition.composition_type.as_str()));
                if let Some(name) = &composition.name {
                    element.push_attribute(("name", name.as_str()));
                }
                write_empty(writer, element);
            }
            write_end(writer, "Compositions");
        }

        if !component.children.is_empty() {
            write_start(writer, BytesStart::new("Components"));
            for &child in &component.children {
                let child_type = components[child].component_type.clone();
                self.write_component(writer, device, components, child, &child_type);
            }
            write_end(writer, "Components");
        }

        write_end(writer, element_name);
    }

    fn write_data_item_declaration(
        &self,
        writer: &mut Writer<Vec<u8>>,
        item: &Arc<mtc_model::DataItem>,
    ) {
        let mut element = BytesStart::new("DataItem");
        element.push_attribute(("category", item.category().as_str()));
        element.push_attribute(("id", item.id()));
        element.push_attribute(("type", item.type_name()));
        if let Some(sub_type) = item.sub_type() {
            element.push_attribute(("subType", sub_type));
        }
        if let Some(name) = item.name() {
            element.push_attribute(("name", name));
        }
        if let Some(units) = item.units() {
            element.push_attribute(("units", units));
        }
        if item.representation() != Representation::Value {
            element.push_attribute(("representation", item.representation().as_str()));
        }
        if item.is_discrete() {
            element.push_attribute(("discrete", "true"));
        }

        let has_children = item.constant_value().is_some() || !item.filters().is_empty();
        if !has_children {
            write_empty(writer, element);
            return;
        }
        write_start(writer, element);
        if let Some(constant) = item.constant_value() {
            write_start(writer, BytesStart::new("Constraints"));
            write_start(writer, BytesStart::new("Value"));
            write_text(writer, constant);
            write_end(writer, "Value");
            write_end(writer, "Constraints");
        }
        if !item.filters().is_empty() {
            write_start(writer, BytesStart::new("Filters"));
            for filter in item.filters() {
                let (filter_type, value) = match filter {
                    Filter::MinimumDelta(v) => ("MINIMUM_DELTA", Some(v.to_string())),
                    Filter::Period(v) => ("PERIOD", Some(v.to_string())),
                    Filter::Duplicate => ("DUPLICATE", None),
                };
                let mut element = BytesStart::new("Filter");
                element.push_attribute(("type", filter_type));
                match value {
                    Some(text) => {
                        write_start(writer, element);
                        write_text(writer, &text);
                        write_end(writer, "Filter");
                    }
                    None => write_empty(writer, element),
                }
            }
            write_end(writer, "Filters");
        }
        write_end(writer, "DataItem");
    }

    fn write_observation(&self, writer: &mut Writer<Vec<u8>>, observation: &Arc<Observation>) {
        let Some(item) = observation.data_item() else {
            return;
        };
        let element_name = match observation.condition() {
            Some(condition) => condition.level.as_str().to_string(),
            None => item.observation_name(),
        };
        let mut element = BytesStart::new(element_name.as_str());
        element.push_attribute(("dataItemId", item.id()));
        element.push_attribute(("timestamp", observation.timestamp_text().as_str()));
        element.push_attribute(("sequence", observation.sequence().to_string().as_str()));
        if let Some(name) = item.name() {
            element.push_attribute(("name", name));
        }
        if observation.condition().is_some() {
            element.push_attribute(("type", item.type_name()));
        }
        if let Some(sub_type) = item.sub_type() {
            element.push_attribute(("subType", sub_type));
        }
        if let Some(condition) = observation.condition() {
            if let Some(v) = &condition.native_code {
                element.push_attribute(("nativeCode", v.as_str()));
            }
            if let Some(v) = &condition.native_severity {
                element.push_attribute(("nativeSeverity", v.as_str()));
            }
            if let Some(v) = &condition.qualifier {
                element.push_attribute(("qualifier", v.as_str()));
            }
        }
        if let Some(reset) = observation.reset_triggered() {
            element.push_attribute(("resetTriggered", reset));
        }
        if let Some(asset_type) = observation.asset_type() {
            element.push_attribute(("assetType", asset_type));
        }
        if let Some(duration) = observation.duration() {
            element.push_attribute(("duration", duration.to_string().as_str()));
        }
        if let Value::TimeSeries { rate, values } = observation.value() {
            element.push_attribute(("sampleCount", values.len().to_string().as_str()));
            if let Some(rate) = rate {
                element.push_attribute(("sampleRate", rate.to_string().as_str()));
            }
        }

        match observation.value() {
            Value::DataSet(set) | Value::Table(set) => {
                element.push_attribute(("count", set.len().to_string().as_str()));
                write_start(writer, element);
                for (key, entry) in set {
                    let mut entry_element = BytesStart::new("Entry");
                    entry_element.push_attribute(("key", key.as_str()));
                    if entry.removed {
                        entry_element.push_attribute(("removed", "true"));
                        write_empty(writer, entry_element);
                        continue;
                    }
                    match &entry.value {
                        Some(mtc_model::DataSetValue::Row(cells)) => {
                            write_start(writer, entry_element);
                            for (cell_key, cell_value) in cells {
                                let mut cell = BytesStart::new("Cell");
                                cell.push_attribute(("key", cell_key.as_str()));
                                write_start(writer, cell);
                                write_text(writer, &cell_value.to_text());
                                write_end(writer, "Cell");
                            }
                            write_end(writer, "Entry");
                        }
                        Some(value) => {
                            write_start(writer, entry_element);
                            write_text(writer, &value.to_text());
                            write_end(writer, "Entry");
                        }
                        None => write_empty(writer, entry_element),
                    }
                }
                write_end(writer, element_name.as_str());
            }
            value => {
                let text = value.to_text();
                if text.is_empty() {
                    write_empty(writer, element);
                } else {
                    write_start(writer, element);
                    write_text(writer, &text);
                    write_end(writer, element_name.as_str());
                }
            }
        }
    }

    fn print_streams(
        &self,
        observations: &[Arc<Observation>],
        header: &DocumentHeader,
    ) -> String {
        let mut writer = self.writer();
        write_decl(&mut writer);
        let mut root = BytesStart::new("MTConnectStreams");
        root.push_attribute(("xmlns", self.namespace("Streams").as_str()));
        write_start(&mut writer, root);
        self.write_header(&mut writer, header, true);
        write_start(&mut writer, BytesStart::new("Streams"));

        for (device, by_component) in group_observations(observations) {
            let mut stream = BytesStart::new("DeviceStream");
            stream.push_attribute(("name", device.name().as_str()));
            stream.push_attribute(("uuid", device.uuid().as_str()));
            write_start(&mut writer, stream);

            for (component_id, items) in by_component {
                let mut component = BytesStart::new("ComponentStream");
                if let Some(info) = device.component_info(&component_id) {
                    component.push_attribute(("component", info.component_type.as_str()));
                    if let Some(name) = &info.name {
                        component.push_attribute(("name", name.as_str()));
                    }
                }
                component.push_attribute(("componentId", component_id.as_str()));
                write_start(&mut writer, component);

                for (section, category) in [
                    ("Samples", Category::Sample),
                    ("Events", Category::Event),
                    ("Condition", Category::Condition),
                ] {
                    let in_section: Vec<_> = items
                        .iter()
                        .filter(|obs| {
                            obs.data_item()
                                .map(|di| di.category() == category)
                                .unwrap_or(false)
                        })
                        .collect();
                    if in_section.is_empty() {
                        continue;
                    }
                    write_start(&mut writer, BytesStart::new(section));
                    for observation in in_section {
                        self.write_observation(&mut writer, observation);
                    }
                    write_end(&mut writer, section);
                }

                write_end(&mut writer, "ComponentStream");
            }
            write_end(&mut writer, "DeviceStream");
        }

        write_end(&mut writer, "Streams");
        write_end(&mut writer, "MTConnectStreams");
        into_string(writer)
    }
}

impl Printer for XmlPrinter {
    fn mime_type(&self) -> &'static str {
        "application/xml"
    }

    fn set_schema_version(&self, version: SchemaVersion) {
        *self.schema_version.write() = version;
    }

    fn set_model_change_time(&self, time: String) {
        *self.model_change_time.write() = Some(time);
    }

    fn print_probe(&self, devices: &[Arc<Device>], header: &DocumentHeader) -> String {
        let mut writer = self.writer();
        write_decl(&mut writer);
        let mut root = BytesStart::new("MTConnectDevices");
        root.push_attribute(("xmlns", self.namespace("Devices").as_str()));
        write_start(&mut writer, root);
        self.write_header(&mut writer, header, false);
        write_start(&mut writer, BytesStart::new("Devices"));
        for device in devices {
            self.write_device(&mut writer, device);
        }
        write_end(&mut writer, "Devices");
        write_end(&mut writer, "MTConnectDevices");
        into_string(writer)
    }

    fn print_current(&self, observations: &[Arc<Observation>], header: &DocumentHeader) -> String {
        self.print_streams(observations, header)
    }

    fn print_sample(&self, observations: &[Arc<Observation>], header: &DocumentHeader) -> String {
        self.print_streams(observations, header)
    }

    fn print_assets(&self, assets: &[Arc<Asset>], header: &DocumentHeader) -> String {
        let mut writer = self.writer();
        write_decl(&mut writer);
        let mut root = BytesStart::new("MTConnectAssets");
        root.push_attribute(("xmlns", self.namespace("Assets").as_str()));
        write_start(&mut writer, root);
        self.write_header(&mut writer, header, false);
        write_start(&mut writer, BytesStart::new("Assets"));
        let mut body = into_string(writer);
        for asset in assets {
            body.push_str(&asset_xml(asset));
        }
        body.push_str("</Assets></MTConnectAssets>");
        body
    }

    fn print_error(&self, code: &str, message: &str, header: &DocumentHeader) -> String {
        let mut writer = self.writer();
        write_decl(&mut writer);
        let mut root = BytesStart::new("MTConnectError");
        root.push_attribute(("xmlns", self.namespace("Error").as_str()));
        write_start(&mut writer, root);
        self.write_header(&mut writer, header, false);
        write_start(&mut writer, BytesStart::new("Errors"));
        let mut error = BytesStart::new("Error");
        error.push_attribute(("errorCode", code));
        write_start(&mut writer, error);
        write_text(&mut writer, message);
        write_end(&mut writer, "Error");
        write_end(&mut writer, "Errors");
        write_end(&mut writer, "MTConnectError");
        into_string(writer)
    }

    fn print_observation(&self, observation: &Arc<Observation>) -> String {
        let mut writer = self.writer();
        self.write_observation(&mut writer, observation);
        into_string(writer)
    }

    fn print_device(&self, device: &Arc<Device>, header: &DocumentHeader) -> String {
        self.print_probe(std::slice::from_ref(device), header)
    }

    fn print_asset(&self, asset: &Arc<Asset>) -> String {
        asset_xml(asset)
    }
}

/// The raw payload, with the removed flag injected when tombstoned
fn asset_xml(asset: &Arc<Asset>) -> String {
    let payload = asset.payload().to_string();
    if !asset.is_removed() {
        return payload;
    }
    match payload.find('>') {
        Some(end) => {
            let insert = if payload[..end].ends_with('/') {
                end - 1
            } else {
                end
            };
            format!(
                "{} removed=\"true\"{}",
                &payload[..insert],
                &payload[insert..]
            )
        }
        None => payload,
    }
}

/// Group observations by owning device (insertion order) then component id
pub(crate) fn group_observations(
    observations: &[Arc<Observation>],
) -> Vec<(Arc<Device>, BTreeMap<String, Vec<Arc<Observation>>>)> {
    let mut order: Vec<Arc<Device>> = Vec::new();
    let mut grouped: Vec<BTreeMap<String, Vec<Arc<Observation>>>> = Vec::new();

    for observation in observations {
        let Some(item) = observation.data_item() else {
            continue;
        };
        let Some(device) = item.device() else {
            continue;
        };
        let index = match order.iter().position(|d| Arc::ptr_eq(d, &device)) {
            Some(index) => index,
            None => {
                order.push(Arc::clone(&device));
                grouped.push(BTreeMap::new());
                order.len() - 1
            }
        };
        grouped[index]
            .entry(item.component_id().to_string())
            .or_default()
            .push(Arc::clone(observation));
    }
    order.into_iter().zip(grouped).collect()
}

fn write_decl(writer: &mut Writer<Vec<u8>>) {
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("in-memory write");
}

fn write_start(writer: &mut Writer<Vec<u8>>, element: BytesStart<'_>) {
    writer
        .write_event(Event::Start(element))
        .expect("in-memory write");
}

fn write_empty(writer: &mut Writer<Vec<u8>>, element: BytesStart<'_>) {
    writer
        .write_event(Event::Empty(element))
        .expect("in-memory write");
}

fn write_end(writer: &mut Writer<Vec<u8>>, name: &str) {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .expect("in-memory write");
}

fn write_text(writer: &mut Writer<Vec<u8>>, text: &str) {
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("in-memory write");
}

fn into_string(writer: Writer<Vec<u8>>) -> String {
    String::from_utf8(writer.into_inner()).expect("printers emit utf-8")
}
