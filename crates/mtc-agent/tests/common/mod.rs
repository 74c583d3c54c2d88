//! Shared fixtures: an agent built from the sample descriptor, a capturing
//! sink, a stub source, and a direct SHDR feed into the real pipeline.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use mtc_agent::{Agent, Sink, Source};
use mtc_config::AgentConfig;
use mtc_model::{Asset, Device, Observation};
use mtc_pipeline::{shdr_pipeline, Entity, Pipeline, PipelineContext, PipelineContract};

pub fn sample_descriptor() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../samples/test_config.xml")
}

pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.device_xml = sample_descriptor();
    config.buffer_size = 8;
    config.checkpoint_frequency = 16;
    config.max_assets = 8;
    config.port = 5000;
    config.host = "127.0.0.1".to_string();
    config
}

pub fn build_agent() -> Arc<Agent> {
    let agent = Agent::new(&test_config());
    agent.initialize().expect("sample descriptor loads");
    agent.initial_observations().expect("initial values seed");
    agent
}

/// A pipeline wired straight into the agent, standing in for a connected
/// adapter.
pub fn shdr_feed(agent: &Arc<Agent>, device: &str) -> Pipeline {
    let context = PipelineContext::new(
        Arc::clone(agent) as Arc<dyn PipelineContract>,
        "test-adapter:7878",
        Some(device.to_string()),
    );
    shdr_pipeline(context)
}

pub fn feed(pipeline: &mut Pipeline, line: &str) {
    pipeline
        .run(Entity::Raw(line.to_string()))
        .expect("record maps");
}

/// Captures everything the kernel fans out.
#[derive(Default)]
pub struct CaptureSink {
    pub observations: Mutex<Vec<Arc<Observation>>>,
    pub assets: Mutex<Vec<Arc<Asset>>>,
    pub devices: Mutex<Vec<Arc<Device>>>,
}

#[async_trait]
impl Sink for CaptureSink {
    fn name(&self) -> &str {
        "CaptureSink"
    }
    async fn start(&self) -> mtc_agent::Result<()> {
        Ok(())
    }
    async fn stop(&self) {}
    fn publish_observation(&self, observation: &Arc<Observation>) {
        self.observations.lock().push(Arc::clone(observation));
    }
    fn publish_asset(&self, asset: &Arc<Asset>) {
        self.assets.lock().push(Arc::clone(asset));
    }
    fn publish_device(&self, device: &Arc<Device>) {
        self.devices.lock().push(Arc::clone(device));
    }
}

/// A source that produces nothing; registers an adapter on the agent device.
pub struct StubSource {
    identity: String,
}

impl StubSource {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl Source for StubSource {
    fn identity(&self) -> &str {
        &self.identity
    }
    async fn start(&self) -> mtc_agent::Result<()> {
        Ok(())
    }
    async fn stop(&self) {}
}
