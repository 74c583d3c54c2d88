//! The ingestion pipeline
//!
//! A pipeline is an ordered chain of transforms with typed input guards.
//! Running an entity walks the chain to the first transform whose guard
//! matches, applies it, and feeds each output to the remainder of the chain;
//! entities no transform claims are dropped. Terminals route into the agent
//! through [`PipelineContract`].

pub mod contract;
pub mod delivery;
pub mod entity;
pub mod shdr;
pub mod upstream;

pub use contract::{PipelineContext, PipelineContract};
pub use delivery::Deliver;
pub use entity::{
    AgentCommand, AssetCommand, ConnectionStatus, Entity, Timestamped, Tokens,
};
pub use upstream::{MTConnectXmlTransform, XmlTransformFeedback};

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// The source error taxonomy. The pipeline driver (the source) decides per
/// variant whether to drop the record, restart the stream, or fail the
/// source.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("adapter failed and cannot recover")]
    AdapterFailed,
    #[error("the stream closed")]
    StreamClosed,
    #[error("the instance id of the upstream agent changed")]
    InstanceIdChanged,
    #[error("the data stream needs to restart")]
    RestartStream,
    #[error("retry the last failed request")]
    RetryRequest,
    #[error("multipart/x-mixed-replace is not available")]
    MultipartStreamFailed,
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Guard verdict for a transform over an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    Run,
    Skip,
}

/// A pipeline stage: a typed input guard plus an application step that may
/// produce any number of outputs for its successors.
pub trait Transform: Send {
    fn name(&self) -> &str;

    fn guard(&self, entity: &Entity) -> GuardAction;

    fn apply(&mut self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>>;
}

pub struct Pipeline {
    context: PipelineContext,
    transforms: Vec<Box<dyn Transform>>,
}

impl Pipeline {
    pub fn new(context: PipelineContext) -> Self {
        Self {
            context,
            transforms: Vec::new(),
        }
    }

    /// Append a transform to the chain.
    pub fn bind(&mut self, transform: Box<dyn Transform>) -> &mut Self {
        self.transforms.push(transform);
        self
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Run an entity through the chain from the head.
    pub fn run(&mut self, entity: Entity) -> Result<()> {
        self.run_from(0, entity)
    }

    fn run_from(&mut self, index: usize, entity: Entity) -> Result<()> {
        for i in index..self.transforms.len() {
            if self.transforms[i].guard(&entity) == GuardAction::Run {
                let outputs = self.transforms[i].apply(entity, &self.context)?;
                for output in outputs {
                    self.run_from(i + 1, output)?;
                }
                return Ok(());
            }
        }
        // no transform claimed it; records nobody understands are dropped
        Ok(())
    }
}

/// The standard SHDR ingest chain: tokenize, extract timestamp, map tokens,
/// deliver.
pub fn shdr_pipeline(context: PipelineContext) -> Pipeline {
    let mut pipeline = Pipeline::new(context);
    pipeline
        .bind(Box::new(shdr::ShdrTokenizer::new()))
        .bind(Box::new(shdr::TimestampExtractor::new()))
        .bind(Box::new(shdr::ShdrTokenMapper::new()))
        .bind(Box::new(Deliver::new()));
    pipeline
}

/// The upstream-agent relay chain: parse the response document, deliver.
/// The feedback handle is shared with the source for stream control.
pub fn upstream_pipeline(
    context: PipelineContext,
    feedback: Arc<Mutex<XmlTransformFeedback>>,
) -> Pipeline {
    let mut pipeline = Pipeline::new(context);
    pipeline
        .bind(Box::new(MTConnectXmlTransform::new(feedback)))
        .bind(Box::new(Deliver::new()));
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;
    impl Transform for Upper {
        fn name(&self) -> &str {
            "Upper"
        }
        fn guard(&self, entity: &Entity) -> GuardAction {
            match entity {
                Entity::Raw(_) => GuardAction::Run,
                _ => GuardAction::Skip,
            }
        }
        fn apply(&mut self, entity: Entity, _: &PipelineContext) -> Result<Vec<Entity>> {
            match entity {
                Entity::Raw(s) => Ok(vec![Entity::Raw(s.to_uppercase())]),
                _ => unreachable!(),
            }
        }
    }

    struct Capture(std::sync::Arc<parking_lot::Mutex<Vec<String>>>);
    impl Transform for Capture {
        fn name(&self) -> &str {
            "Capture"
        }
        fn guard(&self, entity: &Entity) -> GuardAction {
            match entity {
                Entity::Raw(_) => GuardAction::Run,
                _ => GuardAction::Skip,
            }
        }
        fn apply(&mut self, entity: Entity, _: &PipelineContext) -> Result<Vec<Entity>> {
            if let Entity::Raw(s) = entity {
                self.0.lock().push(s);
            }
            Ok(vec![])
        }
    }

    struct NullContract;
    impl PipelineContract for NullContract {
        fn find_device(&self, _: &str) -> Option<std::sync::Arc<mtc_model::Device>> {
            None
        }
        fn default_device(&self) -> Option<std::sync::Arc<mtc_model::Device>> {
            None
        }
        fn find_data_item_by_id(&self, _: &str) -> Option<std::sync::Arc<mtc_model::DataItem>> {
            None
        }
        fn deliver_observation(&self, _: std::sync::Arc<mtc_model::Observation>) {}
        fn deliver_asset(&self, _: std::sync::Arc<mtc_model::Asset>) {}
        fn deliver_asset_command(&self, _: AssetCommand) {}
        fn deliver_command(&self, _: AgentCommand) {}
        fn deliver_connect_status(&self, _: ConnectionStatus) {}
    }

    fn context() -> PipelineContext {
        PipelineContext::new(std::sync::Arc::new(NullContract), "test:7878", None)
    }

    #[test]
    fn chain_feeds_successors() {
        let captured = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(context());
        pipeline
            .bind(Box::new(Upper))
            .bind(Box::new(Capture(captured.clone())));

        pipeline.run(Entity::Raw("hello".into())).unwrap();
        assert_eq!(*captured.lock(), vec!["HELLO".to_string()]);
    }

    #[test]
    fn unclaimed_entities_are_dropped() {
        let mut pipeline = Pipeline::new(context());
        pipeline.bind(Box::new(Upper));
        // no transform guards Tokens; must not error
        pipeline
            .run(Entity::Tokens(Tokens { tokens: vec![] }))
            .unwrap();
    }
}
