//! The agent kernel
//!
//! Ties the device model, buffers, pipeline, and printers together: owns the
//! device registry and the data-item lookup map, reacts to commands and
//! connection events, and fans admitted observations out to sinks. Sources
//! feed pipelines; the loopback source is the only origin of
//! agent-synthesized observations.

pub mod agent;
pub mod agent_device;
pub mod loopback;
pub mod shdr_source;
pub mod sink;
pub mod source;
pub mod upstream_source;

pub use agent::Agent;
pub use loopback::LoopbackSource;
pub use shdr_source::ShdrAdapterSource;
pub use sink::Sink;
pub use source::Source;
pub use upstream_source::UpstreamAgentSource;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] mtc_model::ModelError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("duplicate data item id: {0}")]
    DuplicateDataItemId(String),
    #[error("device {0} already exists, late re-registration is not supported")]
    DeviceExists(String),
    #[error("sink {0} failed to start: {1}")]
    SinkStartup(String, String),
    #[error("source {0} failed to start: {1}")]
    SourceStartup(String, String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
