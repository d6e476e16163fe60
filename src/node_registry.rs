use std::sync::Arc;

use data_model::{CoordinationError, NodeId};
use shared_store::{keys, SharedStore};

/// Allocates globally unique, monotonically increasing local ids scoped per
/// machine name.
///
/// The increment happens atomically in the shared store, so no two calls
/// return the same id for a machine, even across concurrent processes.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn SharedStore>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn allocate_id(&self, machine: &str) -> Result<NodeId, CoordinationError> {
        let local = self
            .store
            .atomic_increment(&keys::node_sequence(machine), 1)?;
        Ok(NodeId::new(machine, local as u64))
    }
}
