//! Upstream-agent relay: parsing streamed MTConnect response documents
//!
//! The transform keeps a feedback record shared with its source: the latched
//! instance id, the next sequence to request, asset events to chase, and any
//! stream-level errors. An instance-id change terminates the current stream
//! (the source must re-probe from sequence 0); document errors request a
//! stream restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use tracing::{debug, warn};

use mtc_model::{
    Condition, ConditionLevel, DataItem, DataSet, DataSetEntry, DataSetValue, Observation, Value,
    UNAVAILABLE,
};

use crate::entity::Entity;
use crate::{GuardAction, PipelineContext, PipelineError, Result, Transform};

/// An AssetChanged / AssetRemoved event seen in an upstream stream. The
/// source fetches the referenced asset out of band.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetEvent {
    pub asset_id: String,
    pub asset_type: Option<String>,
    pub removed: bool,
}

/// A structured error entity from an upstream response
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct XmlTransformFeedback {
    /// 0 until the first document latches it
    pub instance_id: u64,
    pub next_sequence: u64,
    pub asset_events: Vec<AssetEvent>,
    pub errors: Vec<StreamError>,
}

impl XmlTransformFeedback {
    pub fn reset(&mut self) {
        self.instance_id = 0;
        self.next_sequence = 0;
        self.asset_events.clear();
        self.errors.clear();
    }
}

pub struct MTConnectXmlTransform {
    feedback: Arc<Mutex<XmlTransformFeedback>>,
}

impl MTConnectXmlTransform {
    pub fn new(feedback: Arc<Mutex<XmlTransformFeedback>>) -> Self {
        Self { feedback }
    }
}

impl Transform for MTConnectXmlTransform {
    fn name(&self) -> &str {
        "MTConnectXmlTransform"
    }

    fn guard(&self, entity: &Entity) -> GuardAction {
        match entity {
            Entity::Raw(_) => GuardAction::Run,
            _ => GuardAction::Skip,
        }
    }

    fn apply(&mut self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Raw(document) = entity else {
            unreachable!("guarded on Raw");
        };

        let parsed = parse_response_document(&document, context)?;

        let mut feedback = self.feedback.lock();
        if feedback.instance_id != 0 && feedback.instance_id != parsed.instance_id {
            warn!(
                from = feedback.instance_id,
                to = parsed.instance_id,
                "upstream instance id changed"
            );
            feedback.reset();
            return Err(PipelineError::InstanceIdChanged);
        }

        feedback.instance_id = parsed.instance_id;
        feedback.next_sequence = parsed.next_sequence;
        feedback.asset_events = parsed.asset_events;
        feedback.errors = parsed.errors;

        if !feedback.errors.is_empty() {
            return Err(PipelineError::RestartStream);
        }

        Ok(parsed.entities)
    }
}

struct ParsedDocument {
    instance_id: u64,
    next_sequence: u64,
    entities: Vec<Entity>,
    asset_events: Vec<AssetEvent>,
    errors: Vec<StreamError>,
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

fn parse_response_document(document: &str, context: &PipelineContext) -> Result<ParsedDocument> {
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut parsed = ParsedDocument {
        instance_id: 0,
        next_sequence: 0,
        entities: Vec::new(),
        asset_events: Vec::new(),
        errors: Vec::new(),
    };

    let mut root: Option<String> = None;
    // the observation element currently open, if any
    let mut open: Option<PendingObservation> = None;
    let mut open_error: Option<StreamError> = None;
    let mut skip_buf = Vec::new();

    loop {
        match reader.read_event()? {
            XmlEvent::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match (root.as_deref(), name.as_str()) {
                    (None, "MTConnectStreams") | (None, "MTConnectError") => {
                        root = Some(name);
                    }
                    (None, other) => {
                        return Err(PipelineError::Malformed(format!(
                            "unexpected document root <{other}>"
                        )));
                    }
                    (Some(_), "Header") => {
                        let attrs = attributes_of(&e);
                        parsed.instance_id = attrs
                            .get("instanceId")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        parsed.next_sequence = attrs
                            .get("nextSequence")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                    (Some(_), "Streams" | "DeviceStream" | "ComponentStream" | "Samples"
                    | "Events" | "Condition" | "Errors") => {}
                    (Some("MTConnectError"), "Error") => {
                        let attrs = attributes_of(&e);
                        open_error = Some(StreamError {
                            code: attrs.get("errorCode").cloned().unwrap_or_default(),
                            message: String::new(),
                        });
                    }
                    // data-set entries nested in an open observation
                    (Some("MTConnectStreams"), "Entry") if open.is_some() => {
                        if let Some(pending) = open.as_mut() {
                            pending.open_entry(&attributes_of(&e));
                        }
                    }
                    (Some("MTConnectStreams"), "Cell") if open.is_some() => {
                        if let Some(pending) = open.as_mut() {
                            pending.open_cell(&attributes_of(&e));
                        }
                    }
                    (Some("MTConnectStreams"), _) if open.is_none() => {
                        open = Some(PendingObservation::new(&name, attributes_of(&e)));
                    }
                    (Some(_), _) => {
                        let end = e.to_end().into_owned();
                        reader.read_to_end_into(end.name(), &mut skip_buf)?;
                    }
                }
            }
            XmlEvent::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match (root.as_deref(), name.as_str()) {
                    (Some(_), "Header") => {
                        let attrs = attributes_of(&e);
                        parsed.instance_id = attrs
                            .get("instanceId")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        parsed.next_sequence = attrs
                            .get("nextSequence")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                    (Some("MTConnectStreams"), "Streams" | "DeviceStream" | "ComponentStream"
                    | "Samples" | "Events" | "Condition") => {}
                    (Some("MTConnectStreams"), "Entry") if open.is_some() => {
                        if let Some(pending) = open.as_mut() {
                            pending.open_entry(&attributes_of(&e));
                            pending.close_entry();
                        }
                    }
                    (Some("MTConnectStreams"), _) if open.is_none() => {
                        let pending = PendingObservation::new(&name, attributes_of(&e));
                        finish_observation(pending, context, &mut parsed);
                    }
                    _ => {}
                }
            }
            XmlEvent::Text(t) => {
                let text = t.unescape()?.into_owned();
                if let Some(pending) = open.as_mut() {
                    pending.push_text(&text);
                } else if let Some(error) = open_error.as_mut() {
                    error.message.push_str(&text);
                }
            }
            XmlEvent::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "Cell" => {
                        if let Some(pending) = open.as_mut() {
                            pending.close_cell();
                        }
                    }
                    "Entry" => {
                        if let Some(pending) = open.as_mut() {
                            pending.close_entry();
                        }
                    }
                    "Error" => {
                        if let Some(error) = open_error.take() {
                            parsed.errors.push(error);
                        }
                    }
                    _ => {
                        if let Some(pending) = open.take() {
                            finish_observation(pending, context, &mut parsed);
                        }
                    }
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    if root.is_none() {
        return Err(PipelineError::Malformed("empty response document".into()));
    }
    Ok(parsed)
}

struct PendingObservation {
    element: String,
    attrs: HashMap<String, String>,
    text: String,
    /// Parsed `<Entry>`/`<Cell>` children for data sets and tables
    entries: DataSet,
    entry_key: Option<String>,
    entry_removed: bool,
    entry_text: String,
    row: std::collections::BTreeMap<String, DataSetValue>,
    cell_key: Option<String>,
    cell_text: String,
}

impl PendingObservation {
    fn new(element: &str, attrs: HashMap<String, String>) -> Self {
        Self {
            element: element.to_string(),
            attrs,
            text: String::new(),
            entries: DataSet::new(),
            entry_key: None,
            entry_removed: false,
            entry_text: String::new(),
            row: std::collections::BTreeMap::new(),
            cell_key: None,
            cell_text: String::new(),
        }
    }

    fn push_text(&mut self, text: &str) {
        if self.cell_key.is_some() {
            self.cell_text.push_str(text);
        } else if self.entry_key.is_some() {
            self.entry_text.push_str(text);
        } else {
            self.text.push_str(text);
        }
    }

    fn open_entry(&mut self, attrs: &HashMap<String, String>) {
        self.entry_key = attrs.get("key").cloned();
        self.entry_removed = attrs.get("removed").map(|v| v == "true").unwrap_or(false);
        self.entry_text.clear();
        self.row.clear();
    }

    fn close_entry(&mut self) {
        let Some(key) = self.entry_key.take() else {
            return;
        };
        let entry = if self.entry_removed {
            DataSetEntry::removed()
        } else if !self.row.is_empty() {
            DataSetEntry::value(DataSetValue::Row(std::mem::take(&mut self.row)))
        } else {
            DataSetEntry::value(DataSetValue::from_token(self.entry_text.trim()))
        };
        self.entries.insert(key, entry);
        self.entry_removed = false;
        self.entry_text.clear();
    }

    fn open_cell(&mut self, attrs: &HashMap<String, String>) {
        self.cell_key = attrs.get("key").cloned();
        self.cell_text.clear();
    }

    fn close_cell(&mut self) {
        if let Some(key) = self.cell_key.take() {
            self.row
                .insert(key, DataSetValue::from_token(self.cell_text.trim()));
        }
        self.cell_text.clear();
    }
}

fn finish_observation(
    pending: PendingObservation,
    context: &PipelineContext,
    parsed: &mut ParsedDocument,
) {
    let attrs = &pending.attrs;
    let value_text = pending.text.trim();

    // asset events feed the source's asset chase, not the local stream
    if pending.element == "AssetChanged" || pending.element == "AssetRemoved" {
        if value_text != UNAVAILABLE && !value_text.is_empty() {
            parsed.asset_events.push(AssetEvent {
                asset_id: value_text.to_string(),
                asset_type: attrs.get("assetType").cloned(),
                removed: pending.element == "AssetRemoved",
            });
        }
        return;
    }

    let Some(id) = attrs.get("dataItemId") else {
        debug!(element = %pending.element, "stream element without dataItemId");
        return;
    };
    let Some(item) = context.contract.find_data_item_by_id(id) else {
        debug!(data_item = %id, "upstream data item not in local model");
        return;
    };

    let timestamp = attrs
        .get("timestamp")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let condition_level = ConditionLevel::parse(&pending.element);
    let (value, condition) = if let Some(level) = condition_level {
        if level == ConditionLevel::Unavailable {
            (Value::Unavailable, Some(Condition::unavailable()))
        } else {
            (
                Value::Text(value_text.to_string()),
                Some(Condition {
                    level,
                    native_code: attrs.get("nativeCode").cloned(),
                    native_severity: attrs.get("nativeSeverity").cloned(),
                    qualifier: attrs.get("qualifier").cloned(),
                }),
            )
        }
    } else if !pending.entries.is_empty() {
        // Entry/Cell children parsed along the way
        let set = pending.entries.clone();
        let value = if item.is_table() {
            Value::Table(set)
        } else {
            Value::DataSet(set)
        };
        (value, None)
    } else {
        (parse_value(&item, value_text), None)
    };

    let mut observation = Observation::new(&item, value, timestamp);
    if let Some(condition) = condition {
        observation = observation.with_condition(condition);
    }
    if let Some(reset) = attrs.get("resetTriggered") {
        observation = observation.with_reset_triggered(reset.clone());
    }
    if let Some(asset_type) = attrs.get("assetType") {
        observation = observation.with_asset_type(asset_type.clone());
    }
    parsed.entities.push(Entity::Observation(Arc::new(observation)));
}

fn parse_value(item: &Arc<DataItem>, text: &str) -> Value {
    if text.is_empty() || text == UNAVAILABLE {
        return Value::Unavailable;
    }
    if item.is_time_series() {
        let values: Vec<f64> = text
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        return Value::TimeSeries { rate: None, values };
    }
    if item.is_data_set() {
        // entries in stream documents use the same k=v text form
        let set: DataSet = text
            .split_whitespace()
            .filter_map(|entry| {
                let (k, v) = entry.split_once('=')?;
                Some((
                    k.to_string(),
                    DataSetEntry::value(DataSetValue::from_token(v)),
                ))
            })
            .collect();
        return if item.is_table() {
            Value::Table(set)
        } else {
            Value::DataSet(set)
        };
    }
    if item.is_sample() {
        if let Ok(v) = text.parse::<f64>() {
            return Value::Sample(v);
        }
    }
    Value::Text(text.to_string())
}
