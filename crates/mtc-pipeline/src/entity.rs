//! Entities flowing through the pipeline
//!
//! The transform DAG is typed by guards over this enum rather than a class
//! hierarchy: each stage names the variants it consumes.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use mtc_model::{Asset, Observation};

#[derive(Debug)]
pub enum Entity {
    /// Raw input: one SHDR line, or one upstream XML document
    Raw(String),
    /// A tokenized SHDR record, order preserved
    Tokens(Tokens),
    /// Tokens with the timestamp split off the front
    Timestamped(Timestamped),
    Observation(Arc<Observation>),
    Asset(Arc<Asset>),
    AssetCommand(AssetCommand),
    AgentCommand(AgentCommand),
    ConnectionStatus(ConnectionStatus),
    /// Envelope produced by transforms that fan out
    Entities(Vec<Entity>),
}

#[derive(Debug, PartialEq)]
pub struct Tokens {
    pub tokens: Vec<String>,
}

#[derive(Debug, PartialEq)]
pub struct Timestamped {
    pub timestamp: DateTime<Utc>,
    pub duration: Option<f64>,
    pub tokens: Vec<String>,
}

/// Asset mutation requested over the wire
#[derive(Debug, Clone, PartialEq)]
pub enum AssetCommand {
    RemoveAsset {
        device: Option<String>,
        asset_id: String,
    },
    RemoveAll {
        device: Option<String>,
        asset_type: Option<String>,
    },
}

/// A `*<name>: <value>` adapter command
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCommand {
    pub device: Option<String>,
    pub source: String,
    pub command: String,
    pub value: String,
}

/// Adapter connection lifecycle, driving the connection coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connecting {
        source: String,
    },
    Connected {
        source: String,
        devices: Vec<String>,
        auto_available: bool,
    },
    Disconnected {
        source: String,
        devices: Vec<String>,
        auto_available: bool,
    },
}

impl ConnectionStatus {
    pub fn source(&self) -> &str {
        match self {
            Self::Connecting { source }
            | Self::Connected { source, .. }
            | Self::Disconnected { source, .. } => source,
        }
    }
}
