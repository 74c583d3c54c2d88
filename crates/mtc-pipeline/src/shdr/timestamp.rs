//! Timestamp extraction
//!
//! SHDR records may lead with an ISO 8601 timestamp, optionally carrying a
//! `@<seconds>` duration suffix. Records without one are stamped with the
//! agent's clock.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::entity::{Entity, Timestamped, Tokens};
use crate::{GuardAction, PipelineContext, Result, Transform};

pub struct TimestampExtractor;

impl TimestampExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Parse a leading timestamp token. Tolerates fractional seconds and a
    /// trailing `@<seconds>` duration; naive timestamps are taken as UTC.
    fn parse(token: &str) -> Option<(DateTime<Utc>, Option<f64>)> {
        let (stamp, duration) = match token.split_once('@') {
            Some((stamp, dur)) => (stamp, dur.parse::<f64>().ok()),
            None => (token, None),
        };

        if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp) {
            return Some((parsed.with_timezone(&Utc), duration));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some((naive.and_utc(), duration));
        }
        None
    }
}

impl Default for TimestampExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for TimestampExtractor {
    fn name(&self) -> &str {
        "TimestampExtractor"
    }

    fn guard(&self, entity: &Entity) -> GuardAction {
        match entity {
            Entity::Tokens(_) => GuardAction::Run,
            _ => GuardAction::Skip,
        }
    }

    fn apply(&mut self, entity: Entity, _context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Tokens(Tokens { mut tokens }) = entity else {
            unreachable!("guarded on Tokens");
        };
        if tokens.is_empty() {
            return Ok(vec![]);
        }

        let (timestamp, duration) = match Self::parse(&tokens[0]) {
            Some((timestamp, duration)) => {
                tokens.remove(0);
                (timestamp, duration)
            }
            None => (Utc::now(), None),
        };

        if tokens.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![Entity::Timestamped(Timestamped {
            timestamp,
            duration,
            tokens,
        })])
    }
}
