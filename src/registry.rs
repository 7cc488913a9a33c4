//! Process-wide default node (spec §6 "one optional primary node", §9
//! "Singleton primary node"), plus the handler-discovery convention (spec §6
//! "Handler-metadata convention", §9 "Dynamic handler discovery").
//!
//! The source pattern — decorators stamping attributes on functions, later
//! scanned off an instance's attribute surface — has no reflection analogue
//! in Rust. [`HandlerRegistry`] is the discovery pass made explicit: a type
//! implements it to register every handler it owns, instead of a runtime
//! scan finding them.

use std::sync::{Arc, OnceLock};

use crate::error::HandlerError;
use crate::node::Node;

static PRIMARY: OnceLock<Arc<Node>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
#[error("primary node already set")]
pub struct PrimaryAlreadySet;

/// An init-once slot, not ambient mutable state — setting it twice fails
/// rather than silently overwriting (spec §6 "setting it twice fails").
pub fn set_primary_node(node: Arc<Node>) -> Result<(), PrimaryAlreadySet> {
    PRIMARY.set(node).map_err(|_| PrimaryAlreadySet)
}

pub fn primary_node() -> Option<&'static Arc<Node>> {
    PRIMARY.get()
}

/// A type that knows how to register all of its own handlers against a node
/// (spec §6 "A utility discovers *all* methods of a given instance that
/// carry the handler-metadata convention, and registers each").
#[async_trait::async_trait]
pub trait HandlerRegistry: Send + Sync {
    async fn register_handlers(&self, node: &Node) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fake::FakeBroker;
    use crate::config::NodeConfig;

    #[test]
    fn double_set_fails() {
        // OnceLock is process-global and shared across test binaries that
        // link this crate, so only assert the second call never succeeds —
        // don't assert on the first, other tests in the same binary may
        // have already claimed it.
        let broker: Arc<dyn crate::channel::Channel> = Arc::new(FakeBroker::new());
        let node = Node::new(broker, NodeConfig::new("redis://unused/"));
        let _ = set_primary_node(node.clone());
        assert!(set_primary_node(node).is_err());
    }
}
