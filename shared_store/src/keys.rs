//! Explicit key schema for the shared store.
//!
//! Every entity kind gets its own namespace and a typed constructor, so
//! correctness never rests on ad hoc key-string formatting at call sites.
//! Counters, sets and hashes each live under a dedicated namespace.

use std::fmt::{self, Display};

use data_model::NodeId;

/// Per-machine sequence counters backing `allocate_id`.
pub const NODE_SEQUENCES: &str = "node_sequences";
/// VM records; presence means registered.
pub const VMS: &str = "vms";
/// Per-VM metadata hashes.
pub const VM_METADATA: &str = "vm_metadata";
/// Factory records carrying the current assignment.
pub const FACTORIES: &str = "factories";
/// Fleet-wide sets and counters.
pub const FLEET: &str = "fleet";

/// A fully qualified store key: a namespace plus an id within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub namespace: &'static str,
    pub id: String,
}

impl Key {
    fn new(namespace: &'static str, id: impl Into<String>) -> Self {
        Self {
            namespace,
            id: id.into(),
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Counter key for a machine's local-id sequence.
pub fn node_sequence(machine: &str) -> Key {
    Key::new(NODE_SEQUENCES, machine)
}

/// Record key for a VM.
pub fn vm_record(id: &NodeId) -> Key {
    Key::new(VMS, id.key())
}

/// Hash key for a VM's metadata mapping.
pub fn vm_metadata(id: &NodeId) -> Key {
    Key::new(VM_METADATA, id.key())
}

/// Record key for a factory.
pub fn factory_record(id: &NodeId) -> Key {
    Key::new(FACTORIES, id.key())
}

/// Set of VM ids awaiting destruction.
pub fn dirty_queue() -> Key {
    Key::new(FLEET, "dirty_vms")
}

/// Counter of concurrently outstanding clean-build assignments.
pub fn outstanding_clean_builds() -> Key {
    Key::new(FLEET, "outstanding_clean_builds")
}
