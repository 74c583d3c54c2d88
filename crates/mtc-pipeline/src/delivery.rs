//! The delivery terminal
//!
//! Routes typed entities into the agent kernel: observations to the buffer
//! path, assets to the asset store path, commands to the command handler,
//! connection status to the connection coordinator.

use crate::entity::Entity;
use crate::{GuardAction, PipelineContext, Result, Transform};

pub struct Deliver;

impl Deliver {
    pub fn new() -> Self {
        Self
    }

    fn deliver(&self, entity: Entity, context: &PipelineContext) {
        match entity {
            Entity::Observation(observation) => {
                context.contract.deliver_observation(observation);
            }
            Entity::Asset(asset) => context.contract.deliver_asset(asset),
            Entity::AssetCommand(command) => context.contract.deliver_asset_command(command),
            Entity::AgentCommand(command) => context.contract.deliver_command(command),
            Entity::ConnectionStatus(status) => context.contract.deliver_connect_status(status),
            Entity::Entities(entities) => {
                for inner in entities {
                    self.deliver(inner, context);
                }
            }
            Entity::Raw(_) | Entity::Tokens(_) | Entity::Timestamped(_) => {}
        }
    }
}

impl Default for Deliver {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for Deliver {
    fn name(&self) -> &str {
        "Deliver"
    }

    fn guard(&self, entity: &Entity) -> GuardAction {
        match entity {
            Entity::Observation(_)
            | Entity::Asset(_)
            | Entity::AssetCommand(_)
            | Entity::AgentCommand(_)
            | Entity::ConnectionStatus(_)
            | Entity::Entities(_) => GuardAction::Run,
            _ => GuardAction::Skip,
        }
    }

    fn apply(&mut self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        self.deliver(entity, context);
        Ok(vec![])
    }
}
