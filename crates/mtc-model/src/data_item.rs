//! Data items: named, typed streams of values attached to a component
//!
//! A `DataItem` is created by the descriptor parser (or by device
//! verification for required device-level items) and is exclusively owned by
//! its component. Runtime-mutable state (calibration, discrete promotion,
//! the claiming adapter) sits behind interior mutability so the shared
//! `Arc<DataItem>` can be mutated from the kernel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::observer::ObserverInner;
use crate::{ModelError, Result};

/// Data item category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Sample,
    Event,
    Condition,
}

impl Category {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SAMPLE" => Some(Self::Sample),
            "EVENT" => Some(Self::Event),
            "CONDITION" => Some(Self::Condition),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sample => "SAMPLE",
            Self::Event => "EVENT",
            Self::Condition => "CONDITION",
        }
    }
}

/// Value representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Representation {
    #[default]
    Value,
    DataSet,
    Table,
    TimeSeries,
    Discrete,
}

impl Representation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VALUE" => Some(Self::Value),
            "DATA_SET" => Some(Self::DataSet),
            "TABLE" => Some(Self::Table),
            "TIME_SERIES" => Some(Self::TimeSeries),
            "DISCRETE" => Some(Self::Discrete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Value => "VALUE",
            Self::DataSet => "DATA_SET",
            Self::Table => "TABLE",
            Self::TimeSeries => "TIME_SERIES",
            Self::Discrete => "DISCRETE",
        }
    }
}

/// Admission filter attached to a data item. Filtered-out observations are
/// rejected by the buffer with sequence 0.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Suppress an observation equal to the latest reported value
    Duplicate,
    /// Suppress a sample within `delta` of the latest reported value
    MinimumDelta(f64),
    /// Suppress observations closer than `seconds` to the latest
    Period(f64),
}

/// Linear unit conversion (`value * factor + offset`), set from the
/// descriptor or from a `calibration` adapter command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConversion {
    pub factor: f64,
    pub offset: f64,
}

impl UnitConversion {
    pub fn new(factor: f64, offset: f64) -> Self {
        Self { factor, offset }
    }

    pub fn convert(&self, value: f64) -> f64 {
        value * self.factor + self.offset
    }
}

/// A named, typed stream of values attached to a component
pub struct DataItem {
    id: String,
    name: Option<String>,
    type_name: String,
    sub_type: Option<String>,
    category: Category,
    representation: Representation,
    units: Option<String>,
    constant_value: Option<String>,
    filters: Vec<Filter>,
    /// Pub/sub routing override
    topic: Option<String>,
    component_id: String,

    discrete: AtomicBool,
    data_source: RwLock<Option<String>>,
    conversion: RwLock<Option<UnitConversion>>,
    /// Component path within the device, fixed once at registry intake
    path: OnceCell<String>,
    /// Owning device; a back reference, never an owner
    device: RwLock<Weak<crate::device::Device>>,
    observers: Mutex<Vec<Weak<ObserverInner>>>,
}

impl std::fmt::Debug for DataItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataItem")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("category", &self.category)
            .field("representation", &self.representation)
            .finish()
    }
}

impl DataItem {
    /// Build a data item from descriptor attributes.
    ///
    /// Required: `id`, `type`, `category`. Everything else is optional and
    /// defaults the way the standard does.
    pub fn make(attrs: &HashMap<String, String>) -> Result<Self> {
        let id = attrs
            .get("id")
            .cloned()
            .ok_or_else(|| ModelError::MissingAttribute {
                element: "DataItem".into(),
                attribute: "id".into(),
            })?;
        let type_name =
            attrs
                .get("type")
                .cloned()
                .ok_or_else(|| ModelError::MissingAttribute {
                    element: "DataItem".into(),
                    attribute: "type".into(),
                })?;
        let category = attrs
            .get("category")
            .and_then(|c| Category::parse(c))
            .ok_or_else(|| ModelError::InvalidDataItem {
                id: id.clone(),
                reason: "missing or unknown category".into(),
            })?;
        let representation = match attrs.get("representation") {
            Some(r) => Representation::parse(r).ok_or_else(|| ModelError::InvalidDataItem {
                id: id.clone(),
                reason: format!("unknown representation '{r}'"),
            })?,
            None => Representation::Value,
        };
        let discrete = attrs.get("discrete").map(|d| d == "true").unwrap_or(false)
            || representation == Representation::Discrete;

        Ok(Self {
            id,
            name: attrs.get("name").cloned(),
            type_name,
            sub_type: attrs.get("subType").cloned(),
            category,
            representation,
            units: attrs.get("units").cloned(),
            constant_value: None,
            filters: Vec::new(),
            topic: attrs.get("topic").cloned(),
            component_id: String::new(),
            discrete: AtomicBool::new(discrete),
            data_source: RwLock::new(None),
            conversion: RwLock::new(None),
            path: OnceCell::new(),
            device: RwLock::new(Weak::new()),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The name adapters address this item by: `name` when present, else `id`
    pub fn source_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn sub_type(&self) -> Option<&str> {
        self.sub_type.as_deref()
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }

    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    pub fn is_condition(&self) -> bool {
        self.category == Category::Condition
    }

    pub fn is_sample(&self) -> bool {
        self.category == Category::Sample
    }

    pub fn is_data_set(&self) -> bool {
        matches!(
            self.representation,
            Representation::DataSet | Representation::Table
        )
    }

    pub fn is_table(&self) -> bool {
        self.representation == Representation::Table
    }

    pub fn is_time_series(&self) -> bool {
        self.representation == Representation::TimeSeries
    }

    pub fn is_discrete(&self) -> bool {
        self.discrete.load(Ordering::Relaxed)
    }

    /// Promote to discrete (ASSET_CHANGED at schema >= 1.5)
    pub fn make_discrete(&self) {
        self.discrete.store(true, Ordering::Relaxed);
    }

    pub fn constant_value(&self) -> Option<&str> {
        self.constant_value.as_deref()
    }

    pub fn set_constant_value(&mut self, value: impl Into<String>) {
        self.constant_value = Some(value.into());
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn add_filter(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub(crate) fn set_component_id(&mut self, id: impl Into<String>) {
        self.component_id = id.into();
    }

    /// The adapter identity that feeds this item, if one has claimed it
    pub fn data_source(&self) -> Option<String> {
        self.data_source.read().clone()
    }

    pub fn set_data_source(&self, source: impl Into<String>) {
        *self.data_source.write() = Some(source.into());
    }

    pub fn conversion(&self) -> Option<UnitConversion> {
        *self.conversion.read()
    }

    pub fn set_conversion(&self, conversion: UnitConversion) {
        *self.conversion.write() = Some(conversion);
    }

    /// Apply the unit conversion if one is configured
    pub fn convert_value(&self, value: f64) -> f64 {
        match *self.conversion.read() {
            Some(conv) => conv.convert(value),
            None => value,
        }
    }

    /// The owning device, once attached at intake
    pub fn device(&self) -> Option<std::sync::Arc<crate::device::Device>> {
        self.device.read().upgrade()
    }

    pub(crate) fn set_device(&self, device: Weak<crate::device::Device>) {
        *self.device.write() = device;
    }

    /// Component path within the owning device ("Axes[Axes]/Linear[X]").
    /// Empty until the device computes paths at intake.
    pub fn path(&self) -> &str {
        self.path.get().map(String::as_str).unwrap_or("")
    }

    pub(crate) fn set_path(&self, path: String) {
        let _ = self.path.set(path);
    }

    /// Element name used by printers and topics: PascalCase type plus the
    /// representation suffix ("PathPosition", "WorkOffsetTable").
    pub fn observation_name(&self) -> String {
        let mut name = pascal_case(&self.type_name);
        match self.representation {
            Representation::DataSet => name.push_str("DataSet"),
            Representation::Table => name.push_str("Table"),
            Representation::TimeSeries => name.push_str("TimeSeries"),
            Representation::Value | Representation::Discrete => {}
        }
        name
    }

    // --- observers -------------------------------------------------------

    pub(crate) fn add_observer(&self, observer: Weak<ObserverInner>) {
        self.observers.lock().push(observer);
    }

    /// Wake every observer with `sequence`. Sequence 0 is the shutdown
    /// sentinel that releases blocked streamers.
    pub fn signal_observers(&self, sequence: u64) {
        let mut observers = self.observers.lock();
        observers.retain(|weak| match weak.upgrade() {
            Some(inner) => {
                inner.signal(sequence);
                true
            }
            None => false,
        });
    }
}

/// "ASSET_CHANGED" -> "AssetChanged"
pub fn pascal_case(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    for word in type_name.split('_') {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
        }
    }
    out
}
