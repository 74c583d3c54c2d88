//! JSON printer
//!
//! Two wire formats: version 1 wraps repeated elements in arrays of
//! single-key objects, version 2 groups them into keyed maps of arrays.
//! The selection is configuration, never content.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use serde_json::{json, Map, Value as Json};

use mtc_model::{
    Asset, Category, Component, DataSetValue, Device, Observation, SchemaVersion, Value,
};

use crate::xml::group_observations;
use crate::{DocumentHeader, Printer};

pub struct JsonPrinter {
    version: u8,
    pretty: bool,
    schema_version: RwLock<SchemaVersion>,
    model_change_time: RwLock<Option<String>>,
}

impl JsonPrinter {
    pub fn new(version: u8, pretty: bool) -> Self {
        Self {
            version,
            pretty,
            schema_version: RwLock::new(SchemaVersion::DEFAULT),
            model_change_time: RwLock::new(None),
        }
    }

    fn render(&self, value: &Json) -> String {
        if self.pretty {
            serde_json::to_string_pretty(value).unwrap_or_default()
        } else {
            serde_json::to_string(value).unwrap_or_default()
        }
    }

    fn header_json(&self, header: &DocumentHeader, streams: bool) -> Json {
        let mut map = Map::new();
        map.insert(
            "creationTime".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        map.insert("sender".into(), json!(header.sender));
        map.insert("instanceId".into(), json!(header.instance_id));
        map.insert(
            "version".into(),
            json!(self.schema_version.read().to_string()),
        );
        map.insert("bufferSize".into(), json!(header.buffer_size));
        map.insert("assetBufferSize".into(), json!(header.asset_buffer_size));
        map.insert("assetCount".into(), json!(header.asset_count));
        if streams {
            map.insert("firstSequence".into(), json!(header.first_sequence));
            map.insert("lastSequence".into(), json!(header.last_sequence));
            map.insert("nextSequence".into(), json!(header.next_sequence));
        }
        if let Some(time) = self.model_change_time.read().as_ref() {
            map.insert("deviceModelChangeTime".into(), json!(time));
        }
        Json::Object(map)
    }

    /// Version split: v1 is an array of single-key objects, v2 a map of
    /// arrays keyed by element name.
    fn collect(&self, items: Vec<(String, Json)>) -> Json {
        if self.version == 1 {
            Json::Array(
                items
                    .into_iter()
                    .map(|(name, value)| single(name, value))
                    .collect(),
            )
        } else {
            let mut map = Map::new();
            for (name, value) in items {
                map.entry(name)
                    .or_insert_with(|| Json::Array(Vec::new()))
                    .as_array_mut()
                    .expect("inserted as array")
                    .push(value);
            }
            Json::Object(map)
        }
    }

    fn device_json(&self, device: &Arc<Device>) -> Json {
        device.with_components(|components| self.component_json(device, components, 0))
    }

    fn component_json(&self, device: &Arc<Device>, components: &[Component], index: usize) -> Json {
        let component = &components[index];
        let mut map = Map::new();
        map.insert("id".into(), json!(component.id));
        if index == 0 {
            map.insert("name".into(), json!(device.name()));
            map.insert("uuid".into(), json!(device.uuid()));
            let description = device.description();
            let mut desc = Map::new();
            if let Some(v) = description.manufacturer {
                desc.insert("manufacturer".into(), json!(v));
            }
            if let Some(v) = description.model {
                desc.insert("model".into(), json!(v));
            }
            if let Some(v) = description.serial_number {
                desc.insert("serialNumber".into(), json!(v));
            }
            if let Some(v) = description.station {
                desc.insert("station".into(), json!(v));
            }
            if let Some(v) = description.value {
                desc.insert("value".into(), json!(v));
            }
            if !desc.is_empty() {
                map.insert("Description".into(), Json::Object(desc));
            }
        } else {
            if let Some(name) = &component.name {
                map.insert("name".into(), json!(name));
            }
        }

        if !component.data_items.is_empty() {
            let items: Vec<(String, Json)> = component
                .data_items
                .iter()
                .map(|item| {
                    let mut di = Map::new();
                    di.insert("category".into(), json!(item.category().as_str()));
                    di.insert("id".into(), json!(item.id()));
                    di.insert("type".into(), json!(item.type_name()));
                    if let Some(v) = item.name() {
                        di.insert("name".into(), json!(v));
                    }
                    if let Some(v) = item.sub_type() {
                        di.insert("subType".into(), json!(v));
                    }
                    if let Some(v) = item.units() {
                        di.insert("units".into(), json!(v));
                    }
                    if item.representation() != mtc_model::Representation::Value {
                        di.insert(
                            "representation".into(),
                            json!(item.representation().as_str()),
                        );
                    }
                    if item.is_discrete() {
                        di.insert("discrete".into(), json!(true));
                    }
                    ("DataItem".to_string(), Json::Object(di))
                })
                .collect();
            map.insert("DataItems".into(), self.collect(items));
        }

        if !component.children.is_empty() {
            let children: Vec<(String, Json)> = component
                .children
                .iter()
                .map(|&child| {
                    (
                        components[child].component_type.clone(),
                        self.component_json(device, components, child),
                    )
                })
                .collect();
            map.insert("Components".into(), self.collect(children));
        }

        Json::Object(map)
    }

    fn observation_json(&self, observation: &Arc<Observation>) -> Option<(String, Json)> {
        let item = observation.data_item()?;
        let name = match observation.condition() {
            Some(condition) => condition.level.as_str().to_string(),
            None => item.observation_name(),
        };

        let mut map = Map::new();
        map.insert("dataItemId".into(), json!(item.id()));
        map.insert("timestamp".into(), json!(observation.timestamp_text()));
        map.insert("sequence".into(), json!(observation.sequence()));
        if let Some(v) = item.name() {
            map.insert("name".into(), json!(v));
        }
        if observation.condition().is_some() {
            map.insert("type".into(), json!(item.type_name()));
        }
        if let Some(v) = item.sub_type() {
            map.insert("subType".into(), json!(v));
        }
        if let Some(condition) = observation.condition() {
            if let Some(v) = &condition.native_code {
                map.insert("nativeCode".into(), json!(v));
            }
            if let Some(v) = &condition.native_severity {
                map.insert("nativeSeverity".into(), json!(v));
            }
            if let Some(v) = &condition.qualifier {
                map.insert("qualifier".into(), json!(v));
            }
        }
        if let Some(v) = observation.reset_triggered() {
            map.insert("resetTriggered".into(), json!(v));
        }
        if let Some(v) = observation.asset_type() {
            map.insert("assetType".into(), json!(v));
        }
        if let Some(v) = observation.duration() {
            map.insert("duration".into(), json!(v));
        }
        map.insert("value".into(), value_json(observation.value()));
        if let Value::TimeSeries { rate, values } = observation.value() {
            map.insert("sampleCount".into(), json!(values.len()));
            if let Some(rate) = rate {
                map.insert("sampleRate".into(), json!(rate));
            }
        }

        Some((name, Json::Object(map)))
    }

    fn streams_json(&self, observations: &[Arc<Observation>], header: &DocumentHeader) -> Json {
        let mut device_streams: Vec<(String, Json)> = Vec::new();
        for (device, by_component) in group_observations(observations) {
            let mut component_streams: Vec<(String, Json)> = Vec::new();
            for (component_id, items) in by_component {
                let mut stream = Map::new();
                if let Some(info) = device.component_info(&component_id) {
                    stream.insert("component".into(), json!(info.component_type));
                    if let Some(name) = info.name {
                        stream.insert("name".into(), json!(name));
                    }
                }
                stream.insert("componentId".into(), json!(component_id));

                for (section, category) in [
                    ("Samples", Category::Sample),
                    ("Events", Category::Event),
                    ("Condition", Category::Condition),
                ] {
                    let in_section: Vec<(String, Json)> = items
                        .iter()
                        .filter(|obs| {
                            obs.data_item()
                                .map(|di| di.category() == category)
                                .unwrap_or(false)
                        })
                        .filter_map(|obs| self.observation_json(obs))
                        .collect();
                    if !in_section.is_empty() {
                        stream.insert(section.into(), self.collect(in_section));
                    }
                }

                component_streams.push(("ComponentStream".to_string(), Json::Object(stream)));
            }

            device_streams.push((
                "DeviceStream".to_string(),
                json!({
                    "name": device.name(),
                    "uuid": device.uuid(),
                    "ComponentStreams": self.collect(component_streams),
                }),
            ));
        }

        json!({
            "MTConnectStreams": {
                "Header": self.header_json(header, true),
                "Streams": self.collect(device_streams),
            }
        })
    }

    fn asset_json(&self, asset: &Arc<Asset>) -> (String, Json) {
        let mut map = Map::new();
        map.insert("assetId".into(), json!(asset.asset_id()));
        if let Some(uuid) = asset.device_uuid() {
            map.insert("deviceUuid".into(), json!(uuid));
        }
        map.insert(
            "timestamp".into(),
            json!(asset
                .timestamp()
                .to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        if asset.is_removed() {
            map.insert("removed".into(), json!(true));
        }
        map.insert("xml".into(), json!(asset.payload()));
        (asset.asset_type().to_string(), Json::Object(map))
    }
}

fn data_set_json(set: &mtc_model::DataSet) -> Json {
    let mut map = Map::new();
    for (key, entry) in set {
        if entry.removed {
            continue;
        }
        let value = match &entry.value {
            Some(DataSetValue::Int(i)) => json!(i),
            Some(DataSetValue::Float(f)) => json!(f),
            Some(DataSetValue::Text(s)) => json!(s),
            Some(DataSetValue::Row(row)) => {
                let mut cells = Map::new();
                for (cell_key, cell_value) in row {
                    cells.insert(
                        cell_key.clone(),
                        match cell_value {
                            DataSetValue::Int(i) => json!(i),
                            DataSetValue::Float(f) => json!(f),
                            other => json!(other.to_text()),
                        },
                    );
                }
                Json::Object(cells)
            }
            None => Json::Null,
        };
        map.insert(key.clone(), value);
    }
    Json::Object(map)
}

fn single(name: String, value: Json) -> Json {
    let mut map = Map::new();
    map.insert(name, value);
    Json::Object(map)
}

fn value_json(value: &Value) -> Json {
    match value {
        Value::Unavailable => json!("UNAVAILABLE"),
        Value::Text(s) => json!(s),
        Value::Sample(v) => json!(v),
        Value::TimeSeries { values, .. } => json!(values),
        Value::DataSet(set) | Value::Table(set) => data_set_json(set),
    }
}

impl Printer for JsonPrinter {
    fn mime_type(&self) -> &'static str {
        "application/json"
    }

    fn set_schema_version(&self, version: SchemaVersion) {
        *self.schema_version.write() = version;
    }

    fn set_model_change_time(&self, time: String) {
        *self.model_change_time.write() = Some(time);
    }

    fn print_probe(&self, devices: &[Arc<Device>], header: &DocumentHeader) -> String {
        let items: Vec<(String, Json)> = devices
            .iter()
            .map(|device| {
                let name = if device.is_agent() { "Agent" } else { "Device" };
                (name.to_string(), self.device_json(device))
            })
            .collect();
        self.render(&json!({
            "MTConnectDevices": {
                "Header": self.header_json(header, false),
                "Devices": self.collect(items),
            }
        }))
    }

    fn print_current(&self, observations: &[Arc<Observation>], header: &DocumentHeader) -> String {
        self.render(&self.streams_json(observations, header))
    }

    fn print_sample(&self, observations: &[Arc<Observation>], header: &DocumentHeader) -> String {
        self.render(&self.streams_json(observations, header))
    }

    fn print_assets(&self, assets: &[Arc<Asset>], header: &DocumentHeader) -> String {
        let items: Vec<(String, Json)> = assets.iter().map(|a| self.asset_json(a)).collect();
        self.render(&json!({
            "MTConnectAssets": {
                "Header": self.header_json(header, false),
                "Assets": self.collect(items),
            }
        }))
    }

    fn print_error(&self, code: &str, message: &str, header: &DocumentHeader) -> String {
        self.render(&json!({
            "MTConnectError": {
                "Header": self.header_json(header, false),
                "Errors": self.collect(vec![(
                    "Error".to_string(),
                    json!({ "errorCode": code, "value": message }),
                )]),
            }
        }))
    }

    fn print_observation(&self, observation: &Arc<Observation>) -> String {
        match self.observation_json(observation) {
            Some((name, value)) => self.render(&single(name, value)),
            None => String::new(),
        }
    }

    fn print_device(&self, device: &Arc<Device>, _header: &DocumentHeader) -> String {
        let name = if device.is_agent() { "Agent" } else { "Device" };
        self.render(&single(name.to_string(), self.device_json(device)))
    }

    fn print_asset(&self, asset: &Arc<Asset>) -> String {
        let (name, value) = self.asset_json(asset);
        self.render(&single(name, value))
    }
}
