//! Observations: immutable values admitted against a data item
//!
//! The buffer assigns the sequence exactly once at admission; everything else
//! about an observation is fixed at construction. Data-set and table values
//! carry per-entry removal markers and merge into the previous reported set
//! unless a reset was triggered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;

use crate::data_item::DataItem;
use crate::UNAVAILABLE;

/// A single data-set cell value. Table rows are sets whose entries are rows.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSetValue {
    Text(String),
    Int(i64),
    Float(f64),
    Row(BTreeMap<String, DataSetValue>),
}

impl DataSetValue {
    /// Parse a scalar cell, preferring integer, then float, else text.
    pub fn from_token(token: &str) -> Self {
        if let Ok(i) = token.parse::<i64>() {
            DataSetValue::Int(i)
        } else if let Ok(f) = token.parse::<f64>() {
            DataSetValue::Float(f)
        } else {
            DataSetValue::Text(token.to_string())
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            DataSetValue::Text(s) => s.clone(),
            DataSetValue::Int(i) => i.to_string(),
            DataSetValue::Float(f) => f.to_string(),
            DataSetValue::Row(row) => {
                let cells: Vec<String> =
                    row.iter().map(|(k, v)| format!("{k}={}", v.to_text())).collect();
                format!("{{{}}}", cells.join(" "))
            }
        }
    }
}

/// One data-set entry; `removed` marks a deletion of the key
#[derive(Debug, Clone, PartialEq)]
pub struct DataSetEntry {
    pub value: Option<DataSetValue>,
    pub removed: bool,
}

impl DataSetEntry {
    pub fn value(value: DataSetValue) -> Self {
        Self {
            value: Some(value),
            removed: false,
        }
    }

    pub fn removed() -> Self {
        Self {
            value: None,
            removed: true,
        }
    }
}

pub type DataSet = BTreeMap<String, DataSetEntry>;

/// Merge `update` into `base`: removed entries delete their key, everything
/// else upserts. This is the default (non-reset) data-set semantics.
pub fn merge_data_set(base: &mut DataSet, update: &DataSet) {
    for (key, entry) in update {
        if entry.removed {
            base.remove(key);
        } else {
            base.insert(key.clone(), entry.clone());
        }
    }
}

/// Condition state beyond the value text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionLevel {
    Unavailable,
    Normal,
    Warning,
    Fault,
}

impl ConditionLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UNAVAILABLE" => Some(Self::Unavailable),
            "NORMAL" => Some(Self::Normal),
            "WARNING" => Some(Self::Warning),
            "FAULT" => Some(Self::Fault),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "Unavailable",
            Self::Normal => "Normal",
            Self::Warning => "Warning",
            Self::Fault => "Fault",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub level: ConditionLevel,
    pub native_code: Option<String>,
    pub native_severity: Option<String>,
    pub qualifier: Option<String>,
}

impl Condition {
    pub fn unavailable() -> Self {
        Self {
            level: ConditionLevel::Unavailable,
            native_code: None,
            native_severity: None,
            qualifier: None,
        }
    }
}

/// Observation payload
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unavailable,
    Text(String),
    Sample(f64),
    TimeSeries {
        rate: Option<f64>,
        values: Vec<f64>,
    },
    DataSet(DataSet),
    Table(DataSet),
}

impl Value {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Value::Unavailable)
    }

    /// Flat text rendering, used by printers and duplicate filtering
    pub fn to_text(&self) -> String {
        match self {
            Value::Unavailable => UNAVAILABLE.to_string(),
            Value::Text(s) => s.clone(),
            Value::Sample(v) => v.to_string(),
            Value::TimeSeries { values, .. } => values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            Value::DataSet(set) | Value::Table(set) => set
                .iter()
                .filter(|(_, e)| !e.removed)
                .map(|(k, e)| match &e.value {
                    Some(v) => format!("{k}={}", v.to_text()),
                    None => k.clone(),
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// An immutable value admitted to the circular buffer against a data item
pub struct Observation {
    data_item: RwLock<Weak<DataItem>>,
    data_item_id: String,
    timestamp: DateTime<Utc>,
    duration: Option<f64>,
    sequence: AtomicU64,
    value: Value,
    condition: Option<Condition>,
    reset_triggered: Option<String>,
    /// Asset type carried by ASSET_CHANGED / ASSET_REMOVED events
    asset_type: Option<String>,
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("data_item_id", &self.data_item_id)
            .field("sequence", &self.sequence())
            .field("timestamp", &self.timestamp)
            .field("value", &self.value)
            .finish()
    }
}

impl Observation {
    pub fn new(data_item: &Arc<DataItem>, value: Value, timestamp: DateTime<Utc>) -> Self {
        let condition = if data_item.is_condition() && value.is_unavailable() {
            Some(Condition::unavailable())
        } else {
            None
        };
        Self {
            data_item: RwLock::new(Arc::downgrade(data_item)),
            data_item_id: data_item.id().to_string(),
            timestamp,
            duration: None,
            sequence: AtomicU64::new(0),
            value,
            condition,
            reset_triggered: None,
            asset_type: None,
        }
    }

    pub fn with_duration(mut self, duration: Option<f64>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_reset_triggered(mut self, reset: impl Into<String>) -> Self {
        self.reset_triggered = Some(reset.into());
        self
    }

    pub fn with_asset_type(mut self, asset_type: impl Into<String>) -> Self {
        self.asset_type = Some(asset_type.into());
        self
    }

    pub fn data_item(&self) -> Option<Arc<DataItem>> {
        self.data_item.read().upgrade()
    }

    /// Rebind the weak handle after a device replace kept the id but swapped
    /// the data item object.
    pub fn rebind_data_item(&self, data_item: &Arc<DataItem>) {
        *self.data_item.write() = Arc::downgrade(data_item);
    }

    pub fn data_item_id(&self) -> &str {
        &self.data_item_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// RFC 3339 / ISO 8601 with UTC designator, as printed in documents
    pub fn timestamp_text(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// 0 until admitted to the buffer
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Written exactly once by the buffer at admission.
    pub fn assign_sequence(&self, sequence: u64) {
        debug_assert_eq!(self.sequence.load(Ordering::Relaxed), 0);
        self.sequence.store(sequence, Ordering::Release);
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub fn reset_triggered(&self) -> Option<&str> {
        self.reset_triggered.as_deref()
    }

    pub fn asset_type(&self) -> Option<&str> {
        self.asset_type.as_deref()
    }

    pub fn is_unavailable(&self) -> bool {
        match &self.condition {
            Some(c) => c.level == ConditionLevel::Unavailable,
            None => self.value.is_unavailable(),
        }
    }

    /// The latest-value view of this observation given the previously
    /// reported one. Data sets and tables merge entry-wise unless this
    /// observation triggered a reset; everything else replaces.
    pub fn merged_with(self: &Arc<Self>, previous: Option<&Arc<Observation>>) -> Arc<Observation> {
        let (base, update) = match (&self.value, previous.map(|p| &p.value)) {
            (Value::DataSet(update), Some(Value::DataSet(base)))
            | (Value::Table(update), Some(Value::Table(base)))
                if self.reset_triggered.is_none() =>
            {
                (base.clone(), update)
            }
            _ => return Arc::clone(self),
        };

        let mut merged = base;
        merge_data_set(&mut merged, update);
        let value = match &self.value {
            Value::Table(_) => Value::Table(merged),
            _ => Value::DataSet(merged),
        };

        let merged_obs = Observation {
            data_item: RwLock::new(self.data_item.read().clone()),
            data_item_id: self.data_item_id.clone(),
            timestamp: self.timestamp,
            duration: self.duration,
            sequence: AtomicU64::new(self.sequence()),
            value,
            condition: self.condition.clone(),
            reset_triggered: self.reset_triggered.clone(),
            asset_type: self.asset_type.clone(),
        };
        Arc::new(merged_obs)
    }
}
