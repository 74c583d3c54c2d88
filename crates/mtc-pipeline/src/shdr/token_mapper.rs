//! SHDR token mapping: timestamped tokens to typed entities
//!
//! Handles the `@ASSET@` family, `*command: value` records, and per-category
//! observation parsing (condition six-field form, time series, data sets and
//! tables, plain samples and events).

use std::collections::HashMap;
use std::sync::Arc;

use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use tracing::{debug, warn};

use mtc_model::{
    Asset, Condition, ConditionLevel, DataItem, DataSet, DataSetEntry, DataSetValue, Observation,
    Value, UNAVAILABLE,
};

use crate::entity::{AgentCommand, AssetCommand, Entity, Timestamped};
use crate::{GuardAction, PipelineContext, PipelineError, Result, Transform};

pub struct ShdrTokenMapper;

impl ShdrTokenMapper {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShdrTokenMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for ShdrTokenMapper {
    fn name(&self) -> &str {
        "ShdrTokenMapper"
    }

    fn guard(&self, entity: &Entity) -> GuardAction {
        match entity {
            Entity::Timestamped(_) => GuardAction::Run,
            _ => GuardAction::Skip,
        }
    }

    fn apply(&mut self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Timestamped(record) = entity else {
            unreachable!("guarded on Timestamped");
        };

        match record.tokens[0].as_str() {
            "@ASSET@" => map_asset(&record, context),
            "@REMOVE_ASSET@" => {
                let asset_id = record
                    .tokens
                    .get(1)
                    .filter(|t| !t.is_empty())
                    .cloned()
                    .ok_or_else(|| PipelineError::Malformed("@REMOVE_ASSET@ without id".into()))?;
                Ok(vec![Entity::AssetCommand(AssetCommand::RemoveAsset {
                    device: context.default_device.clone(),
                    asset_id,
                })])
            }
            "@REMOVE_ALL_ASSETS@" => Ok(vec![Entity::AssetCommand(AssetCommand::RemoveAll {
                device: context.default_device.clone(),
                asset_type: record.tokens.get(1).filter(|t| !t.is_empty()).cloned(),
            })]),
            first if first.starts_with('*') => map_command(&record, context),
            _ => map_observations(&record, context),
        }
    }
}

fn map_asset(record: &Timestamped, context: &PipelineContext) -> Result<Vec<Entity>> {
    if record.tokens.len() < 4 {
        return Err(PipelineError::Malformed(
            "@ASSET@ needs id, type, and a payload".into(),
        ));
    }
    let asset_id = record.tokens[1].clone();
    let asset_type = record.tokens[2].clone();
    // the payload is the remainder of the line; restore any pipes the
    // tokenizer split away
    let payload = record.tokens[3..].join("|");

    let attrs = root_attributes(&payload);
    let device = attrs
        .get("deviceUuid")
        .cloned()
        .or_else(|| context.default_device.clone());

    let asset = Asset::new(asset_id, asset_type, device, record.timestamp, payload);
    Ok(vec![Entity::Asset(Arc::new(asset))])
}

/// Attributes of the payload's root element
fn root_attributes(xml: &str) -> HashMap<String, String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) | Ok(XmlEvent::Empty(e)) => {
                return e
                    .attributes()
                    .filter_map(|a| a.ok())
                    .filter_map(|a| {
                        let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                        let value = a.unescape_value().ok()?.into_owned();
                        Some((key, value))
                    })
                    .collect();
            }
            Ok(XmlEvent::Eof) | Err(_) => return HashMap::new(),
            _ => {}
        }
    }
}

fn map_command(record: &Timestamped, context: &PipelineContext) -> Result<Vec<Entity>> {
    // calibration values carry pipes; the command is the whole record
    let joined = record.tokens.join("|");
    let body = joined.trim_start_matches('*').trim();
    let Some((name, value)) = body.split_once(':') else {
        warn!(record = %joined, "cannot parse command");
        return Ok(vec![]);
    };
    Ok(vec![Entity::AgentCommand(AgentCommand {
        device: context.default_device.clone(),
        source: context.source.clone(),
        command: name.trim().to_ascii_lowercase(),
        value: value.trim().to_string(),
    })])
}

fn map_observations(record: &Timestamped, context: &PipelineContext) -> Result<Vec<Entity>> {
    let mut outputs = Vec::new();
    let tokens = &record.tokens;
    let mut i = 0;

    while i < tokens.len() {
        let name_token = &tokens[i];
        i += 1;
        if name_token.is_empty() {
            continue;
        }

        let (device_key, item_name) = match name_token.split_once(':') {
            Some((device, name)) => (Some(device.to_string()), name),
            None => (context.default_device.clone(), name_token.as_str()),
        };

        let Some(item) = context
            .contract
            .find_data_item(device_key.as_deref(), item_name)
        else {
            debug!(name = item_name, "no data item for token, skipping value");
            i += 1;
            continue;
        };
        if item.data_source().is_none() {
            item.set_data_source(&context.source);
        }

        let observation = if item.is_condition() {
            let fields: Vec<&str> = tokens[i..(i + 5).min(tokens.len())]
                .iter()
                .map(String::as_str)
                .collect();
            i += fields.len();
            map_condition(&fields)
        } else if item.is_time_series() {
            let fields: Vec<&str> = tokens[i..(i + 3).min(tokens.len())]
                .iter()
                .map(String::as_str)
                .collect();
            i += fields.len();
            map_time_series(&item, &fields)
        } else {
            let value_token = tokens.get(i).map(String::as_str).unwrap_or("");
            i += 1;
            if item.is_data_set() {
                map_data_set(&item, value_token)
            } else {
                map_scalar(&item, value_token)
            }
        };

        match observation {
            Some((value, condition, reset)) => {
                let mut obs =
                    Observation::new(&item, value, record.timestamp).with_duration(record.duration);
                if let Some(condition) = condition {
                    obs = obs.with_condition(condition);
                }
                if let Some(reset) = reset {
                    obs = obs.with_reset_triggered(reset);
                }
                outputs.push(Entity::Observation(Arc::new(obs)));
            }
            None => {
                debug!(data_item = item.id(), "unparseable value, record dropped");
            }
        }
    }

    Ok(outputs)
}

type Mapped = (Value, Option<Condition>, Option<String>);

fn map_condition(fields: &[&str]) -> Option<Mapped> {
    let level_token = fields.first().copied().unwrap_or(UNAVAILABLE);
    let level = ConditionLevel::parse(level_token)?;
    if level == ConditionLevel::Unavailable {
        return Some((Value::Unavailable, Some(Condition::unavailable()), None));
    }

    let non_empty = |index: usize| -> Option<String> {
        fields
            .get(index)
            .filter(|f| !f.is_empty())
            .map(|f| f.to_string())
    };
    let condition = Condition {
        level,
        native_code: non_empty(1),
        native_severity: non_empty(2),
        qualifier: non_empty(3),
    };
    let message = non_empty(4).unwrap_or_default();
    Some((Value::Text(message), Some(condition), None))
}

fn map_time_series(item: &Arc<DataItem>, fields: &[&str]) -> Option<Mapped> {
    if fields.first() == Some(&UNAVAILABLE) {
        return Some((Value::Unavailable, None, None));
    }
    let count: usize = fields.first()?.parse().ok()?;
    let rate = fields
        .get(1)
        .filter(|f| !f.is_empty())
        .and_then(|f| f.parse::<f64>().ok());
    let values: Vec<f64> = fields
        .get(2)?
        .split_whitespace()
        .filter_map(|v| v.parse::<f64>().ok())
        .map(|v| item.convert_value(v))
        .collect();
    if values.len() != count {
        warn!(
            data_item = item.id(),
            expected = count,
            got = values.len(),
            "time series count mismatch"
        );
    }
    Some((Value::TimeSeries { rate, values }, None, None))
}

fn map_data_set(item: &Arc<DataItem>, token: &str) -> Option<Mapped> {
    if token.is_empty() || token == UNAVAILABLE {
        return Some((Value::Unavailable, None, None));
    }

    // a leading ":NAME" word is the reset modifier
    let (reset, body) = match token.strip_prefix(':') {
        Some(rest) => {
            let (name, remainder) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            (Some(name.to_string()), remainder)
        }
        None => (None, token),
    };

    let set = parse_data_set(body, item.is_table())?;
    let value = if item.is_table() {
        Value::Table(set)
    } else {
        Value::DataSet(set)
    };
    Some((value, None, reset))
}

fn map_scalar(item: &Arc<DataItem>, token: &str) -> Option<Mapped> {
    if token.is_empty() || token == UNAVAILABLE {
        return Some((Value::Unavailable, None, None));
    }
    if item.is_sample() {
        let raw: f64 = token.parse().ok()?;
        Some((Value::Sample(item.convert_value(raw)), None, None))
    } else {
        Some((Value::Text(token.to_string()), None, None))
    }
}

/// Split `a=1 b={X=1 Y=2} c='text'` into top-level entries, brace and quote
/// aware.
fn split_entries(text: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match c {
            '\'' | '"' if quote == Some(c) => {
                quote = None;
                current.push(c);
            }
            '\'' | '"' if quote.is_none() => {
                quote = Some(c);
                current.push(c);
            }
            '{' if quote.is_none() => {
                depth += 1;
                current.push(c);
            }
            '}' if quote.is_none() => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 && quote.is_none() => {
                if !current.is_empty() {
                    entries.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        entries.push(current);
    }
    entries
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn parse_data_set(text: &str, is_table: bool) -> Option<DataSet> {
    let mut set = DataSet::new();
    for entry in split_entries(text) {
        match entry.split_once('=') {
            None => {
                // a bare key removes the entry
                set.insert(entry, DataSetEntry::removed());
            }
            Some((key, "")) => {
                set.insert(key.to_string(), DataSetEntry::removed());
            }
            Some((key, raw)) => {
                let value = if let Some(inner) = raw.strip_prefix('{') {
                    let inner = inner.strip_suffix('}')?;
                    let mut row = std::collections::BTreeMap::new();
                    for cell in split_entries(inner) {
                        let (cell_key, cell_value) = cell.split_once('=')?;
                        row.insert(
                            cell_key.to_string(),
                            DataSetValue::from_token(unquote(cell_value)),
                        );
                    }
                    DataSetValue::Row(row)
                } else if is_table {
                    // table entries must be rows
                    return None;
                } else {
                    DataSetValue::from_token(unquote(raw))
                };
                set.insert(key.to_string(), DataSetEntry::value(value));
            }
        }
    }
    Some(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::PipelineContract;
    use crate::entity::ConnectionStatus;
    use chrono::{TimeZone, Utc};
    use mtc_model::Device;
    use parking_lot::Mutex;

    struct DeviceContract {
        device: Arc<Device>,
        pub observations: Mutex<Vec<Arc<Observation>>>,
    }

    impl DeviceContract {
        fn new(device: Arc<Device>) -> Self {
            Self {
                device,
                observations: Mutex::new(Vec::new()),
            }
        }
    }

    impl PipelineContract for DeviceContract {
        fn find_device(&self, key: &str) -> Option<Arc<Device>> {
            (self.device.uuid() == key || self.device.name() == key)
                .then(|| Arc::clone(&self.device))
        }
        fn default_device(&self) -> Option<Arc<Device>> {
            Some(Arc::clone(&self.device))
        }
        fn find_data_item_by_id(&self, id: &str) -> Option<Arc<DataItem>> {
            self.device.data_item_by_name(id)
        }
        fn deliver_observation(&self, observation: Arc<Observation>) {
            self.observations.lock().push(observation);
        }
        fn deliver_asset(&self, _: Arc<Asset>) {}
        fn deliver_asset_command(&self, _: AssetCommand) {}
        fn deliver_command(&self, _: AgentCommand) {}
        fn deliver_connect_status(&self, _: ConnectionStatus) {}
    }

    fn test_device() -> Arc<Device> {
        let device = Arc::new(Device::new("d", "LinuxCNC", "000"));
        let mut make = |attrs: &[(&str, &str)]| {
            let map: HashMap<String, String> = attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            device.add_data_item(DataItem::make(&map).unwrap());
        };
        make(&[
            ("id", "cn2"),
            ("name", "line"),
            ("type", "LINE"),
            ("category", "EVENT"),
        ]);
        make(&[
            ("id", "xp"),
            ("name", "Xpos"),
            ("type", "POSITION"),
            ("category", "SAMPLE"),
        ]);
        make(&[
            ("id", "v1"),
            ("name", "vars"),
            ("type", "VARIABLE"),
            ("category", "EVENT"),
            ("representation", "DATA_SET"),
        ]);
        make(&[
            ("id", "w1"),
            ("name", "wpo"),
            ("type", "WORK_OFFSET"),
            ("category", "EVENT"),
            ("representation", "TABLE"),
        ]);
        make(&[
            ("id", "al"),
            ("name", "alarm"),
            ("type", "TEMPERATURE"),
            ("category", "CONDITION"),
        ]);
        make(&[
            ("id", "ts1"),
            ("name", "Xts"),
            ("type", "POSITION"),
            ("category", "SAMPLE"),
            ("representation", "TIME_SERIES"),
        ]);
        device
    }

    fn run(line: &str) -> (Vec<Entity>, Arc<Device>) {
        let device = test_device();
        let contract = Arc::new(DeviceContract::new(Arc::clone(&device)));
        let context = PipelineContext::new(contract, "adapter:7878", Some("LinuxCNC".into()));
        let mut mapper = ShdrTokenMapper::new();
        let record = Timestamped {
            timestamp: Utc.with_ymd_and_hms(2021, 2, 1, 12, 0, 0).unwrap(),
            duration: None,
            tokens: line.split('|').map(|t| t.trim().to_string()).collect(),
        };
        let outputs = mapper
            .apply(Entity::Timestamped(record), &context)
            .unwrap();
        (outputs, device)
    }

    fn single_observation(outputs: Vec<Entity>) -> Arc<Observation> {
        assert_eq!(outputs.len(), 1, "expected one output, got {outputs:?}");
        match outputs.into_iter().next().unwrap() {
            Entity::Observation(obs) => obs,
            other => panic!("expected observation, got {other:?}"),
        }
    }

    #[test]
    fn maps_simple_event() {
        let (outputs, _) = run("line|204");
        let obs = single_observation(outputs);
        assert_eq!(obs.data_item_id(), "cn2");
        assert_eq!(obs.value(), &Value::Text("204".into()));
        assert_eq!(
            obs.timestamp(),
            Utc.with_ymd_and_hms(2021, 2, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn maps_sample_and_claims_source() {
        let (outputs, device) = run("Xpos|11.5");
        let obs = single_observation(outputs);
        assert_eq!(obs.value(), &Value::Sample(11.5));
        let item = device.data_item_by_name("Xpos").unwrap();
        assert_eq!(item.data_source().as_deref(), Some("adapter:7878"));
    }

    #[test]
    fn maps_multiple_pairs_in_one_record() {
        let (outputs, _) = run("line|205|Xpos|2.5");
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn unknown_item_skips_one_value() {
        let (outputs, _) = run("nonesuch|1|line|206");
        let obs = single_observation(outputs);
        assert_eq!(obs.data_item_id(), "cn2");
        assert_eq!(obs.value(), &Value::Text("206".into()));
    }

    #[test]
    fn maps_data_set() {
        let (outputs, _) = run("vars|a=1 b=2 c=3");
        let obs = single_observation(outputs);
        match obs.value() {
            Value::DataSet(set) => {
                assert_eq!(set.len(), 3);
                assert_eq!(set["a"].value, Some(DataSetValue::Int(1)));
                assert_eq!(set["c"].value, Some(DataSetValue::Int(3)));
            }
            other => panic!("expected data set, got {other:?}"),
        }
    }

    #[test]
    fn data_set_reset_modifier() {
        let (outputs, _) = run("vars|:MANUAL a=4");
        let obs = single_observation(outputs);
        assert_eq!(obs.reset_triggered(), Some("MANUAL"));
    }

    #[test]
    fn data_set_removed_entry() {
        let (outputs, _) = run("vars|a= b=2");
        let obs = single_observation(outputs);
        match obs.value() {
            Value::DataSet(set) => {
                assert!(set["a"].removed);
                assert!(!set["b"].removed);
            }
            other => panic!("expected data set, got {other:?}"),
        }
    }

    #[test]
    fn maps_table_rows() {
        let (outputs, _) = run(
            "wpo|G53.1={X=1.0 Y=2.0 Z=3.0} G53.2={X=4.0 Y=5.0 Z=6.0} G53.3={X=7.0 Y=8.0 Z=9 U=10.0}",
        );
        let obs = single_observation(outputs);
        match obs.value() {
            Value::Table(rows) => {
                assert_eq!(rows.len(), 3);
                match rows["G53.1"].value.as_ref().unwrap() {
                    DataSetValue::Row(cells) => {
                        assert_eq!(cells["X"], DataSetValue::Float(1.0));
                        assert_eq!(cells["Z"], DataSetValue::Float(3.0));
                    }
                    other => panic!("expected row, got {other:?}"),
                }
                match rows["G53.3"].value.as_ref().unwrap() {
                    DataSetValue::Row(cells) => {
                        assert_eq!(cells.len(), 4);
                        assert_eq!(cells["Z"], DataSetValue::Int(9));
                    }
                    other => panic!("expected row, got {other:?}"),
                }
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn maps_condition_fields() {
        let (outputs, _) = run("alarm|fault|OT100|1|HIGH|Overtemp detected");
        let obs = single_observation(outputs);
        let condition = obs.condition().unwrap();
        assert_eq!(condition.level, ConditionLevel::Fault);
        assert_eq!(condition.native_code.as_deref(), Some("OT100"));
        assert_eq!(condition.qualifier.as_deref(), Some("HIGH"));
        assert_eq!(obs.value(), &Value::Text("Overtemp detected".into()));
    }

    #[test]
    fn condition_unavailable() {
        let (outputs, _) = run("alarm|UNAVAILABLE||||");
        let obs = single_observation(outputs);
        assert!(obs.is_unavailable());
    }

    #[test]
    fn maps_time_series() {
        let (outputs, _) = run("Xts|4|100|1.1 2.2 3.3 4.4");
        let obs = single_observation(outputs);
        match obs.value() {
            Value::TimeSeries { rate, values } => {
                assert_eq!(*rate, Some(100.0));
                assert_eq!(values.len(), 4);
                assert_eq!(values[0], 1.1);
            }
            other => panic!("expected time series, got {other:?}"),
        }
    }

    #[test]
    fn maps_asset_record() {
        let (outputs, _) = run("@ASSET@|@1|Part|<Part assetId='1'>TEST 1</Part>");
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            Entity::Asset(asset) => {
                assert_eq!(asset.asset_id(), "@1");
                assert_eq!(asset.asset_type(), "Part");
                assert_eq!(asset.device_uuid().as_deref(), Some("LinuxCNC"));
                assert!(asset.payload().contains("TEST 1"));
            }
            other => panic!("expected asset, got {other:?}"),
        }
    }

    #[test]
    fn asset_payload_pipes_are_restored() {
        let (outputs, _) = run("@ASSET@|T1|CuttingTool|<CuttingTool assetId='T1'><a>x|y</a></CuttingTool>");
        match &outputs[0] {
            Entity::Asset(asset) => assert!(asset.payload().contains("x|y")),
            other => panic!("expected asset, got {other:?}"),
        }
    }

    #[test]
    fn maps_remove_asset() {
        let (outputs, _) = run("@REMOVE_ASSET@|0001");
        match &outputs[0] {
            Entity::AssetCommand(AssetCommand::RemoveAsset { asset_id, device }) => {
                assert_eq!(asset_id, "0001");
                assert_eq!(device.as_deref(), Some("LinuxCNC"));
            }
            other => panic!("expected remove-asset, got {other:?}"),
        }
    }

    #[test]
    fn maps_remove_all_assets() {
        let (outputs, _) = run("@REMOVE_ALL_ASSETS@|Part");
        match &outputs[0] {
            Entity::AssetCommand(AssetCommand::RemoveAll { asset_type, .. }) => {
                assert_eq!(asset_type.as_deref(), Some("Part"));
            }
            other => panic!("expected remove-all, got {other:?}"),
        }
    }

    #[test]
    fn maps_commands_with_pipes() {
        let (outputs, _) = run("*calibration: Xpos|2.0|1.0");
        match &outputs[0] {
            Entity::AgentCommand(cmd) => {
                assert_eq!(cmd.command, "calibration");
                assert_eq!(cmd.value, "Xpos|2.0|1.0");
                assert_eq!(cmd.source, "adapter:7878");
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn maps_manufacturer_command() {
        let (outputs, _) = run("*manufacturer: Fanuc");
        match &outputs[0] {
            Entity::AgentCommand(cmd) => {
                assert_eq!(cmd.command, "manufacturer");
                assert_eq!(cmd.value, "Fanuc");
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn unavailable_scalar() {
        let (outputs, _) = run("line|UNAVAILABLE");
        let obs = single_observation(outputs);
        assert!(obs.is_unavailable());
    }
}
