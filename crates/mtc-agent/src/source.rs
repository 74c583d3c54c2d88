//! Sources: producers of entities into a pipeline

use async_trait::async_trait;

use crate::Result;

/// A source feeds a pipeline. Lifetime is shared between the agent and its
/// own tasks; `stop` must release anything blocked on I/O.
#[async_trait]
pub trait Source: Send + Sync {
    /// Unique identity ("host:port" for adapters, a url for upstreams)
    fn identity(&self) -> &str;

    /// The loopback source is agent-internal and never counts as an
    /// external input when deciding whether the agent can keep running.
    fn is_loopback(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self);
}
