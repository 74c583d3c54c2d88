//! Entity and device model
//!
//! The typed tree the agent normalizes telemetry against: devices own
//! components, components own data items. Everything downstream of the
//! descriptor parser holds `Arc<DataItem>` owned by the component tree;
//! lookup structures keep `Weak` back-references only.

pub mod asset;
pub mod component;
pub mod data_item;
pub mod descriptor;
pub mod device;
pub mod observation;
pub mod observer;
pub mod registry;
pub mod schema;

pub use asset::{Asset, AssetKind};
pub use component::{Component, Composition, Description};
pub use data_item::{Category, DataItem, Filter, Representation, UnitConversion};
pub use descriptor::parse_devices;
pub use device::Device;
pub use observation::{
    Condition, ConditionLevel, DataSet, DataSetEntry, DataSetValue, Observation, Value,
};
pub use observer::ChangeObserver;
pub use registry::DeviceRegistry;
pub use schema::SchemaVersion;

use thiserror::Error;

pub const UNAVAILABLE: &str = "UNAVAILABLE";
pub const AVAILABLE: &str = "AVAILABLE";

/// Errors raised while building or mutating the device model
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("<{element}> is missing required attribute '{attribute}'")]
    MissingAttribute {
        element: String,
        attribute: String,
    },
    #[error("invalid data item {id}: {reason}")]
    InvalidDataItem { id: String, reason: String },
    #[error("duplicate device uuid: {0}")]
    DuplicateUuid(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
