//! The loopback source
//!
//! The only permitted origin of agent-generated observations: initial
//! values, availability flips, asset and device lifecycle events,
//! connection status. Injects fully-typed observations at the head of the
//! delivery path so every observer channel sees them uniformly.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;

use mtc_model::{DataItem, Observation, Value, UNAVAILABLE};

use crate::agent::Agent;
use crate::source::Source;
use crate::Result;

pub const LOOPBACK_IDENTITY: &str = "AgentSource";

pub struct LoopbackSource {
    agent: Weak<Agent>,
}

impl LoopbackSource {
    pub(crate) fn new(agent: Weak<Agent>) -> Self {
        Self { agent }
    }

    /// Synthesize an observation from a text value ("AVAILABLE", a uuid, ...)
    pub fn receive(&self, item: &Arc<DataItem>, value: &str) {
        let value = if value == UNAVAILABLE || value.is_empty() {
            Value::Unavailable
        } else {
            Value::Text(value.to_string())
        };
        self.receive_value(item, value);
    }

    /// Synthesize an observation from a typed value
    pub fn receive_value(&self, item: &Arc<DataItem>, value: Value) {
        self.deliver(Observation::new(item, value, Utc::now()));
    }

    /// Synthesize with extra properties (asset events, count resets)
    pub fn receive_with(
        &self,
        item: &Arc<DataItem>,
        value: Value,
        asset_type: Option<&str>,
        reset_triggered: Option<&str>,
    ) {
        let mut observation = Observation::new(item, value, Utc::now());
        if let Some(asset_type) = asset_type {
            observation = observation.with_asset_type(asset_type);
        }
        if let Some(reset) = reset_triggered {
            observation = observation.with_reset_triggered(reset);
        }
        self.deliver(observation);
    }

    fn deliver(&self, observation: Observation) {
        if let Some(agent) = self.agent.upgrade() {
            agent.receive_observation(Arc::new(observation));
        }
    }
}

#[async_trait]
impl Source for LoopbackSource {
    fn identity(&self) -> &str {
        LOOPBACK_IDENTITY
    }

    fn is_loopback(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}
