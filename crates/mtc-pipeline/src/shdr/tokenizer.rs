//! SHDR record tokenizer

use crate::entity::{Entity, Tokens};
use crate::{GuardAction, PipelineContext, Result, Transform};

/// Splits a pipe-delimited producer record into ordered tokens. Leading and
/// trailing whitespace of each token is not significant on the wire.
pub struct ShdrTokenizer;

impl ShdrTokenizer {
    pub fn new() -> Self {
        Self
    }

    fn tokenize(line: &str) -> Vec<String> {
        line.split('|').map(|t| t.trim().to_string()).collect()
    }
}

impl Default for ShdrTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for ShdrTokenizer {
    fn name(&self) -> &str {
        "ShdrTokenizer"
    }

    fn guard(&self, entity: &Entity) -> GuardAction {
        match entity {
            Entity::Raw(_) => GuardAction::Run,
            _ => GuardAction::Skip,
        }
    }

    fn apply(&mut self, entity: Entity, _context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Raw(line) = entity else {
            unreachable!("guarded on Raw");
        };
        let line = line.trim();
        if line.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![Entity::Tokens(Tokens {
            tokens: Self::tokenize(line),
        })])
    }
}
