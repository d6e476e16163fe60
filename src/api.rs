use std::sync::Arc;

use data_model::{require_text, CoordinationError, GrabHints, GrabResponse, NodeId};
use serde_json::Value;
use shared_store::SharedStore;

use crate::{
    node_registry::NodeRegistry,
    vm_registry::VmRegistry,
    vmfactory::VmFactoryCoordinator,
};

/// The operations external callers (web dashboard, grading pipeline) invoke
/// as opaque remote calls. No wire format is mandated here; whatever
/// transport fronts this facade hands identifiers across as JSON values,
/// and anything that the contract requires to be text is validated rather
/// than coerced.
#[derive(Clone)]
pub struct CoordinatorApi {
    nodes: NodeRegistry,
    vms: VmRegistry,
    factories: VmFactoryCoordinator,
}

impl CoordinatorApi {
    pub fn new(
        nodes: NodeRegistry,
        vms: VmRegistry,
        factories: VmFactoryCoordinator,
    ) -> Self {
        Self {
            nodes,
            vms,
            factories,
        }
    }

    pub fn from_store(store: Arc<dyn SharedStore>) -> Self {
        let nodes = NodeRegistry::new(store.clone());
        let vms = VmRegistry::new(store.clone());
        let factories = VmFactoryCoordinator::new(store, vms.clone());
        Self::new(nodes, vms, factories)
    }

    pub fn node_allocate_id(&self, machine: &Value) -> Result<NodeId, CoordinationError> {
        let machine = require_text(machine, "machine name")?;
        self.nodes.allocate_id(machine)
    }

    pub fn vm_register(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        self.vms.register(id)
    }

    pub fn vm_unregister(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        self.vms.unregister(id)
    }

    pub fn vm_mark_dirty(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        self.vms.mark_dirty(id)
    }

    pub fn vm_set_metadata(
        &self,
        id: &NodeId,
        key: &Value,
        value: &Value,
    ) -> Result<bool, CoordinationError> {
        let key = require_text(key, "metadata key")?;
        let value = require_text(value, "metadata value")?;
        self.vms.set_metadata(id, key, value)
    }

    pub fn vm_get_metadata(
        &self,
        id: &NodeId,
        key: &Value,
    ) -> Result<Option<String>, CoordinationError> {
        let key = require_text(key, "metadata key")?;
        self.vms.get_metadata(id, key)
    }

    pub fn vmfactory_register(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        self.factories.register(id)
    }

    pub fn vmfactory_unregister(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        self.factories.unregister(id)
    }

    pub fn vmfactory_grab(
        &self,
        id: &NodeId,
        hints: &Value,
    ) -> Result<GrabResponse, CoordinationError> {
        let hints = GrabHints::from_value(hints)?;
        self.factories.grab(id, &hints)
    }

    pub fn vmfactory_note_clean_id(
        &self,
        id: &NodeId,
        vm: &NodeId,
    ) -> Result<bool, CoordinationError> {
        self.factories.note_clean_id(id, vm)
    }

    pub fn vmfactory_finish(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        self.factories.finish(id)
    }
}
