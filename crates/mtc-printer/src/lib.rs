//! Document printers
//!
//! Printers are a capability the kernel holds behind an `(id -> printer)`
//! map; it never depends on which variant answers. Both variants print the
//! probe, current, sample, asset, and error documents plus single-entity
//! payloads for pub/sub sinks.

pub mod json;
pub mod xml;

pub use json::JsonPrinter;
pub use xml::XmlPrinter;

use std::sync::Arc;

use mtc_model::{Asset, Device, Observation, SchemaVersion};

/// Header facts shared by every printed document
#[derive(Debug, Clone, Default)]
pub struct DocumentHeader {
    pub instance_id: u64,
    pub sender: String,
    pub buffer_size: usize,
    pub asset_buffer_size: usize,
    pub asset_count: usize,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub next_sequence: u64,
}

pub trait Printer: Send + Sync {
    /// Content type of the produced documents
    fn mime_type(&self) -> &'static str;

    fn set_schema_version(&self, version: SchemaVersion);

    fn set_model_change_time(&self, time: String);

    /// The device/component tree document
    fn print_probe(&self, devices: &[Arc<Device>], header: &DocumentHeader) -> String;

    /// Latest-value snapshot (a checkpoint's observations)
    fn print_current(&self, observations: &[Arc<Observation>], header: &DocumentHeader) -> String;

    /// A sequence range of observations
    fn print_sample(&self, observations: &[Arc<Observation>], header: &DocumentHeader) -> String;

    fn print_assets(&self, assets: &[Arc<Asset>], header: &DocumentHeader) -> String;

    fn print_error(&self, code: &str, message: &str, header: &DocumentHeader) -> String;

    /// Single-entity payloads for pub/sub sinks
    fn print_observation(&self, observation: &Arc<Observation>) -> String;

    fn print_device(&self, device: &Arc<Device>, header: &DocumentHeader) -> String;

    fn print_asset(&self, asset: &Arc<Asset>) -> String;
}
