//! The pipeline's view of the agent kernel
//!
//! Terminal transforms deliver through this trait; lookups resolve adapter
//! names against the device model. The kernel implements it, tests stub it.

use std::sync::Arc;

use mtc_model::{Asset, DataItem, Device, Observation};

use crate::entity::{AgentCommand, AssetCommand, ConnectionStatus};

pub trait PipelineContract: Send + Sync {
    fn find_device(&self, name_or_uuid: &str) -> Option<Arc<Device>>;

    fn default_device(&self) -> Option<Arc<Device>>;

    /// Resolve an adapter-facing data item name, scoped to a device when the
    /// record names one.
    fn find_data_item(&self, device: Option<&str>, name: &str) -> Option<Arc<DataItem>> {
        let device = match device {
            Some(key) => self.find_device(key),
            None => self.default_device(),
        }?;
        device.data_item_by_name(name)
    }

    /// Resolve by agent-unique id (upstream relay documents carry ids)
    fn find_data_item_by_id(&self, id: &str) -> Option<Arc<DataItem>>;

    fn deliver_observation(&self, observation: Arc<Observation>);

    fn deliver_asset(&self, asset: Arc<Asset>);

    fn deliver_asset_command(&self, command: AssetCommand);

    fn deliver_command(&self, command: AgentCommand);

    fn deliver_connect_status(&self, status: ConnectionStatus);
}

/// Per-source pipeline state shared by every transform in the chain
pub struct PipelineContext {
    pub contract: Arc<dyn PipelineContract>,
    /// Source identity ("host:port" for adapters, the url for upstreams)
    pub source: String,
    /// The device this source feeds when records do not name one
    pub default_device: Option<String>,
}

impl PipelineContext {
    pub fn new(
        contract: Arc<dyn PipelineContract>,
        source: impl Into<String>,
        default_device: Option<String>,
    ) -> Self {
        Self {
            contract,
            source: source.into(),
            default_device,
        }
    }

    pub fn device_key(&self) -> Option<&str> {
        self.default_device.as_deref()
    }
}
