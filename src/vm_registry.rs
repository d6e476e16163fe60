use std::sync::Arc;

use data_model::{CoordinationError, NodeId, VmRecord};
use shared_store::{keys, serializer, SharedStore};

/// Tracks VM existence, dirty status, and per-VM string metadata.
#[derive(Clone)]
pub struct VmRegistry {
    store: Arc<dyn SharedStore>,
}

impl VmRegistry {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Creates the VM record if absent. Returns true iff it was newly
    /// created.
    pub fn register(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        let record = serializer::encode(&VmRecord::default())?;
        Ok(self
            .store
            .compare_and_swap(&keys::vm_record(id), None, Some(&record))?)
    }

    /// Deletes the record, its metadata, and any dirty-queue membership.
    /// Returns true iff something existed. Idempotent on unknown ids.
    pub fn unregister(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        let existed = self.store.delete(&keys::vm_record(id))?;
        self.store.delete(&keys::vm_metadata(id))?;
        let member = serializer::encode(id)?;
        self.store.set_remove(&keys::dirty_queue(), &member)?;
        Ok(existed)
    }

    /// Enqueues the VM for destruction. Always succeeds, including for ids
    /// that were never (or are no longer) registered, so orphaned VMs
    /// discovered after a crash can still be scheduled for destruction.
    pub fn mark_dirty(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        let member = serializer::encode(id)?;
        self.store.set_add(&keys::dirty_queue(), &member)?;
        self.flag_record_dirty(id)?;
        Ok(true)
    }

    pub fn is_registered(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        Ok(self.store.get(&keys::vm_record(id))?.is_some())
    }

    /// Writes one metadata entry. Returns true only on the first write of
    /// that key, false on overwrite.
    pub fn set_metadata(
        &self,
        id: &NodeId,
        key: &str,
        value: &str,
    ) -> Result<bool, CoordinationError> {
        if !self.is_registered(id)? {
            return Err(CoordinationError::NotRegistered { id: id.clone() });
        }
        Ok(self
            .store
            .hash_set(&keys::vm_metadata(id), key, value.as_bytes())?)
    }

    /// Reads one metadata entry. An unknown VM and an absent key both yield
    /// `None`; callers cannot distinguish the two cases.
    pub fn get_metadata(
        &self,
        id: &NodeId,
        key: &str,
    ) -> Result<Option<String>, CoordinationError> {
        match self.store.hash_get(&keys::vm_metadata(id), key)? {
            Some(bytes) => {
                let value = String::from_utf8(bytes).map_err(|e| CoordinationError::Store {
                    source: anyhow::Error::new(e).context("metadata value is not valid utf-8"),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    // Keeps the record's dirty flag truthful for registered VMs; the dirty
    // queue itself is the source of truth for destruction scheduling.
    fn flag_record_dirty(&self, id: &NodeId) -> Result<(), CoordinationError> {
        loop {
            let Some(bytes) = self.store.get(&keys::vm_record(id))? else {
                return Ok(());
            };
            let mut record: VmRecord = serializer::decode(&bytes)?;
            if record.dirty {
                return Ok(());
            }
            record.dirty = true;
            let new = serializer::encode(&record)?;
            if self
                .store
                .compare_and_swap(&keys::vm_record(id), Some(&bytes), Some(&new))?
            {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::local_node;
    use shared_store::{open_store, ConnectionOptions};

    use super::*;

    fn registry() -> VmRegistry {
        VmRegistry::new(open_store(ConnectionOptions::Memory).unwrap())
    }

    #[test]
    fn register_reports_only_actual_transitions() {
        let vms = registry();
        let vm = local_node(0);
        assert!(vms.register(&vm).unwrap());
        assert!(!vms.register(&vm).unwrap());

        let vm2 = local_node(1);
        assert!(vms.register(&vm2).unwrap());
        assert!(!vms.register(&vm2).unwrap());

        assert!(vms.unregister(&vm).unwrap());
        assert!(!vms.unregister(&vm).unwrap());
        assert!(vms.unregister(&vm2).unwrap());
        assert!(!vms.unregister(&vm2).unwrap());
    }

    #[test]
    fn metadata_requires_a_registered_vm() {
        let vms = registry();
        let vm = local_node(0);

        let err = vms.set_metadata(&vm, "bla", "hello").unwrap_err();
        assert!(matches!(err, CoordinationError::NotRegistered { .. }));

        // Querying an unknown VM yields None, same as an absent key.
        assert_eq!(vms.get_metadata(&vm, "bla").unwrap(), None);
    }

    #[test]
    fn metadata_first_write_then_overwrite() {
        let vms = registry();
        let vm = local_node(0);
        assert!(vms.register(&vm).unwrap());

        assert_eq!(vms.get_metadata(&vm, "bla").unwrap(), None);
        assert!(vms.set_metadata(&vm, "bla", "hello").unwrap());
        assert!(!vms.set_metadata(&vm, "bla", "world").unwrap());
        assert_eq!(vms.get_metadata(&vm, "bla").unwrap().as_deref(), Some("world"));
    }

    #[test]
    fn unregister_clears_metadata() {
        let vms = registry();
        let vm = local_node(0);
        assert!(vms.register(&vm).unwrap());
        assert!(vms.set_metadata(&vm, "owner", "grader").unwrap());

        assert!(vms.unregister(&vm).unwrap());
        assert_eq!(vms.get_metadata(&vm, "owner").unwrap(), None);

        // Re-registering starts from a blank slate: first write again.
        assert!(vms.register(&vm).unwrap());
        assert!(vms.set_metadata(&vm, "owner", "grader").unwrap());
    }

    #[test]
    fn mark_dirty_tolerates_unknown_ids() {
        let vms = registry();
        let orphan = local_node(99);
        assert!(vms.mark_dirty(&orphan).unwrap());
        // Marking again is still fine; the queue is a set.
        assert!(vms.mark_dirty(&orphan).unwrap());
    }
}
