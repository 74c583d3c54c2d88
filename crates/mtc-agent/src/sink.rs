//! Sinks: consumers of the agent's three feeds
//!
//! Sinks are fed in registration order, strictly in admission order, and
//! only after the observation is in the buffer. A publish call must not
//! block the kernel: backpressure and batching are the sink's own business.

use std::sync::Arc;

use async_trait::async_trait;

use mtc_model::{Asset, Device, Observation};

use crate::Result;

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    /// An observation was admitted to the buffer
    fn publish_observation(&self, observation: &Arc<Observation>);

    /// An asset was added, updated, or tombstoned
    fn publish_asset(&self, asset: &Arc<Asset>);

    /// The device model changed (added, replaced, or re-keyed)
    fn publish_device(&self, device: &Arc<Device>);
}
