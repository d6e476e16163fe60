use std::sync::Arc;

use data_model::{
    CoordinationError,
    FactoryAssignment,
    FactoryRecord,
    GrabHints,
    GrabResponse,
    NodeId,
};
use shared_store::{keys, serializer, SharedStore};
use tracing::warn;

use crate::vm_registry::VmRegistry;

/// Implements the grab/finish protocol by which factory workers claim
/// exactly one unit of work at a time.
///
/// Per-factory state machine: Unregistered → Registered/Idle ⇄
/// Registered/Assigned, with Unregistered reachable from either registered
/// state via `unregister`. Every decision step is atomic against the shared
/// store; no in-process locking provides any cross-process correctness.
#[derive(Clone)]
pub struct VmFactoryCoordinator {
    store: Arc<dyn SharedStore>,
    vms: VmRegistry,
}

impl VmFactoryCoordinator {
    pub fn new(store: Arc<dyn SharedStore>, vms: VmRegistry) -> Self {
        Self { store, vms }
    }

    /// Creates the factory record in the Idle state. Returns true iff it was
    /// newly created.
    pub fn register(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        let record = serializer::encode(&FactoryRecord::default())?;
        Ok(self
            .store
            .compare_and_swap(&keys::factory_record(id), None, Some(&record))?)
    }

    /// Removes the factory. Returns true iff it was registered.
    ///
    /// A deliberately departing factory may still hold an assignment; its
    /// claimed work is handed back so nothing is lost: a DestroyDirty VM
    /// returns to the dirty queue and a BuildClean slot is released. Crash
    /// recovery is a different matter and is not attempted here.
    pub fn unregister(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        loop {
            let Some(bytes) = self.store.get(&keys::factory_record(id))? else {
                return Ok(false);
            };
            let record: FactoryRecord = serializer::decode(&bytes)?;
            if !self
                .store
                .compare_and_swap(&keys::factory_record(id), Some(&bytes), None)?
            {
                // The record changed under us; re-read and retry.
                continue;
            }
            match record.assignment {
                FactoryAssignment::Idle => {}
                FactoryAssignment::BuildClean { .. } => {
                    warn!(factory_id = %id, "factory unregistered mid-build, releasing its slot");
                    self.store
                        .atomic_increment(&keys::outstanding_clean_builds(), -1)?;
                }
                FactoryAssignment::DestroyDirty { vm } => {
                    warn!(
                        factory_id = %id,
                        vm_id = %vm,
                        "factory unregistered mid-destruction, requeueing the dirty vm"
                    );
                    let member = serializer::encode(&vm)?;
                    self.store.set_add(&keys::dirty_queue(), &member)?;
                }
            }
            return Ok(true);
        }
    }

    /// Claims at most one unit of work for an idle factory.
    ///
    /// Decision order: a queued dirty VM always wins and is never subject to
    /// `max_clean_vms`; otherwise a clean build is admitted while the
    /// outstanding-builds counter is below the cap; otherwise NoWork is
    /// returned, no assignment is recorded, and the caller polls again later.
    /// An absent `max_clean_vms` hint means uncapped.
    pub fn grab(&self, id: &NodeId, hints: &GrabHints) -> Result<GrabResponse, CoordinationError> {
        let (bytes, record) = self.load_factory(id)?;
        if !record.assignment.is_idle() {
            return Err(protocol_error(id, "grab requires an idle factory"));
        }

        // Dirty destruction takes priority and is never capped.
        if let Some(member) = self.store.atomic_pop_from_set(&keys::dirty_queue())? {
            let vm: NodeId = serializer::decode(&member)?;
            let next = FactoryRecord {
                assignment: FactoryAssignment::DestroyDirty { vm: vm.clone() },
            };
            if !self.swap_record(id, &bytes, &next)? {
                // Someone raced us on this factory's record; requeue the vm
                // so it is still handed out exactly once.
                self.store.set_add(&keys::dirty_queue(), &member)?;
                return Err(protocol_error(id, "factory record changed during grab"));
            }
            return Ok(GrabResponse::DestroyDirty(vm));
        }

        // Clean-build admission control: claim a slot, then roll the claim
        // back if it overshot the cap. Never admits beyond the cap.
        let outstanding = self
            .store
            .atomic_increment(&keys::outstanding_clean_builds(), 1)?;
        if let Some(cap) = hints.max_clean_vms {
            if outstanding as u64 > cap {
                self.store
                    .atomic_increment(&keys::outstanding_clean_builds(), -1)?;
                return Ok(GrabResponse::NoWork);
            }
        }
        let next = FactoryRecord {
            assignment: FactoryAssignment::BuildClean { noted_vm: None },
        };
        if !self.swap_record(id, &bytes, &next)? {
            self.store
                .atomic_increment(&keys::outstanding_clean_builds(), -1)?;
            return Err(protocol_error(id, "factory record changed during grab"));
        }
        Ok(GrabResponse::BuildClean)
    }

    /// Records the concrete VM a factory produced for its outstanding clean
    /// build. Does not change the assignment state.
    pub fn note_clean_id(&self, id: &NodeId, vm: &NodeId) -> Result<bool, CoordinationError> {
        let (bytes, record) = self.load_factory(id)?;
        match record.assignment {
            FactoryAssignment::BuildClean { .. } => {
                let next = FactoryRecord {
                    assignment: FactoryAssignment::BuildClean {
                        noted_vm: Some(vm.clone()),
                    },
                };
                if !self.swap_record(id, &bytes, &next)? {
                    return Err(protocol_error(
                        id,
                        "factory record changed while noting the built vm",
                    ));
                }
                Ok(true)
            }
            FactoryAssignment::Idle => Err(protocol_error(
                id,
                "note_clean_id requires an outstanding clean build",
            )),
            FactoryAssignment::DestroyDirty { .. } => Err(protocol_error(
                id,
                "note_clean_id is invalid while destroying a dirty vm",
            )),
        }
    }

    /// Completes the factory's outstanding assignment and returns it to
    /// Idle. A finished clean build registers the noted VM, if one was
    /// noted; with none noted, nothing is registered. A finished dirty
    /// destruction needs no further bookkeeping, the vm id was already
    /// popped from the queue at grab time.
    pub fn finish(&self, id: &NodeId) -> Result<bool, CoordinationError> {
        let (bytes, record) = self.load_factory(id)?;
        match record.assignment {
            FactoryAssignment::Idle => Err(protocol_error(
                id,
                "finish requires an outstanding assignment",
            )),
            FactoryAssignment::BuildClean { noted_vm } => {
                // Clearing the assignment first makes a racing double-finish
                // lose the swap instead of double-decrementing the counter.
                if !self.swap_record(id, &bytes, &FactoryRecord::default())? {
                    return Err(protocol_error(id, "factory record changed during finish"));
                }
                if let Some(vm) = &noted_vm {
                    self.vms.register(vm)?;
                }
                self.store
                    .atomic_increment(&keys::outstanding_clean_builds(), -1)?;
                Ok(true)
            }
            FactoryAssignment::DestroyDirty { .. } => {
                if !self.swap_record(id, &bytes, &FactoryRecord::default())? {
                    return Err(protocol_error(id, "factory record changed during finish"));
                }
                Ok(true)
            }
        }
    }

    fn load_factory(&self, id: &NodeId) -> Result<(Vec<u8>, FactoryRecord), CoordinationError> {
        let Some(bytes) = self.store.get(&keys::factory_record(id))? else {
            return Err(CoordinationError::NotRegistered { id: id.clone() });
        };
        let record = serializer::decode(&bytes)?;
        Ok((bytes, record))
    }

    fn swap_record(
        &self,
        id: &NodeId,
        old: &[u8],
        next: &FactoryRecord,
    ) -> Result<bool, CoordinationError> {
        let encoded = serializer::encode(next)?;
        Ok(self
            .store
            .compare_and_swap(&keys::factory_record(id), Some(old), Some(&encoded))?)
    }
}

fn protocol_error(id: &NodeId, reason: &str) -> CoordinationError {
    CoordinationError::ProtocolState {
        id: id.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use data_model::test_objects::tests::{local_node, UNICODE_PONY};
    use shared_store::{open_store, ConnectionOptions};

    use super::*;

    fn coordinator() -> (VmFactoryCoordinator, VmRegistry) {
        let store = open_store(ConnectionOptions::Memory).unwrap();
        let vms = VmRegistry::new(store.clone());
        (VmFactoryCoordinator::new(store, vms.clone()), vms)
    }

    #[test]
    fn registration_reports_only_actual_transitions() {
        let (factories, _) = coordinator();
        let me = NodeId::new(UNICODE_PONY, 0);

        assert!(!factories.unregister(&me).unwrap());
        assert!(factories.register(&me).unwrap());
        assert!(!factories.register(&me).unwrap());
        assert!(factories.unregister(&me).unwrap());
        assert!(!factories.unregister(&me).unwrap());
    }

    #[test]
    fn grab_on_an_unregistered_factory_is_rejected() {
        let (factories, _) = coordinator();
        let err = factories
            .grab(&local_node(0), &GrabHints::capped(2))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotRegistered { .. }));
    }

    #[test]
    fn grab_clean_then_grab_again_is_a_protocol_error() {
        let (factories, _) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        let hints = GrabHints::capped(2);
        assert_eq!(factories.grab(&me, &hints).unwrap(), GrabResponse::BuildClean);

        let err = factories.grab(&me, &hints).unwrap_err();
        assert!(matches!(err, CoordinationError::ProtocolState { .. }));
    }

    #[test]
    fn grab_prefers_queued_dirty_vms() {
        let (factories, vms) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        let dirty = local_node(1);
        assert!(vms.mark_dirty(&dirty).unwrap());

        assert_eq!(
            factories.grab(&me, &GrabHints::capped(2)).unwrap(),
            GrabResponse::DestroyDirty(dirty)
        );

        let err = factories.grab(&me, &GrabHints::capped(2)).unwrap_err();
        assert!(matches!(err, CoordinationError::ProtocolState { .. }));
    }

    #[test]
    fn two_factories_split_two_dirty_vms_exactly_once() {
        let (factories, vms) = coordinator();
        let f1 = local_node(10);
        let f2 = local_node(11);
        assert!(factories.register(&f1).unwrap());
        assert!(factories.register(&f2).unwrap());

        let v1 = local_node(1);
        let v2 = local_node(2);
        assert!(vms.mark_dirty(&v1).unwrap());
        assert!(vms.mark_dirty(&v2).unwrap());

        let hints = GrabHints::capped(2);
        let mut handed_out = HashSet::new();
        for factory in [&f1, &f2] {
            match factories.grab(factory, &hints).unwrap() {
                GrabResponse::DestroyDirty(vm) => {
                    // Never the same id twice, never BuildClean while dirty
                    // entries remain.
                    assert!(handed_out.insert(vm));
                }
                other => panic!("expected DestroyDirty, got {:?}", other),
            }
        }
        assert_eq!(handed_out, HashSet::from([v1, v2]));
    }

    #[test]
    fn clean_workflow_grab_note_finish_repeats() {
        let (factories, vms) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        let hints = GrabHints::capped(20);
        for i in 0..10 {
            assert_eq!(factories.grab(&me, &hints).unwrap(), GrabResponse::BuildClean);

            let built = local_node(i + 1);
            assert!(factories.note_clean_id(&me, &built).unwrap());

            assert!(factories.finish(&me).unwrap());
            assert!(vms.is_registered(&built).unwrap());

            let err = factories.finish(&me).unwrap_err();
            assert!(matches!(err, CoordinationError::ProtocolState { .. }));
        }
    }

    #[test]
    fn finish_without_noted_id_registers_nothing() {
        let (factories, vms) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        assert_eq!(
            factories.grab(&me, &GrabHints::capped(2)).unwrap(),
            GrabResponse::BuildClean
        );
        assert!(factories.finish(&me).unwrap());
        assert!(!vms.is_registered(&local_node(1)).unwrap());

        let err = factories.finish(&me).unwrap_err();
        assert!(matches!(err, CoordinationError::ProtocolState { .. }));
    }

    #[test]
    fn finish_before_grab_is_a_protocol_error() {
        let (factories, _) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        let err = factories.finish(&me).unwrap_err();
        assert!(matches!(err, CoordinationError::ProtocolState { .. }));
    }

    #[test]
    fn note_clean_id_outside_a_build_is_a_protocol_error() {
        let (factories, vms) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        // Idle.
        let err = factories.note_clean_id(&me, &local_node(1)).unwrap_err();
        assert!(matches!(err, CoordinationError::ProtocolState { .. }));

        // DestroyDirty.
        assert!(vms.mark_dirty(&local_node(2)).unwrap());
        assert!(matches!(
            factories.grab(&me, &GrabHints::capped(2)).unwrap(),
            GrabResponse::DestroyDirty(_)
        ));
        let err = factories.note_clean_id(&me, &local_node(1)).unwrap_err();
        assert!(matches!(err, CoordinationError::ProtocolState { .. }));
    }

    #[test]
    fn zero_cap_with_empty_dirty_queue_yields_no_work() {
        let (factories, _) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        assert_eq!(
            factories.grab(&me, &GrabHints::capped(0)).unwrap(),
            GrabResponse::NoWork
        );
        // No assignment was recorded; grabbing again is legal.
        assert_eq!(
            factories.grab(&me, &GrabHints::capped(0)).unwrap(),
            GrabResponse::NoWork
        );
    }

    #[test]
    fn cap_bounds_concurrently_outstanding_builds() {
        let (factories, _) = coordinator();
        let f1 = local_node(1);
        let f2 = local_node(2);
        let f3 = local_node(3);
        for f in [&f1, &f2, &f3] {
            assert!(factories.register(f).unwrap());
        }

        let hints = GrabHints::capped(2);
        assert_eq!(factories.grab(&f1, &hints).unwrap(), GrabResponse::BuildClean);
        assert_eq!(factories.grab(&f2, &hints).unwrap(), GrabResponse::BuildClean);
        assert_eq!(factories.grab(&f3, &hints).unwrap(), GrabResponse::NoWork);

        // Finishing one build frees one slot.
        assert!(factories.finish(&f1).unwrap());
        assert_eq!(factories.grab(&f3, &hints).unwrap(), GrabResponse::BuildClean);
    }

    #[test]
    fn missing_cap_means_uncapped() {
        let (factories, _) = coordinator();
        let hints = GrabHints::default();
        for i in 0..5 {
            let f = local_node(i);
            assert!(factories.register(&f).unwrap());
            assert_eq!(factories.grab(&f, &hints).unwrap(), GrabResponse::BuildClean);
        }
    }

    #[test]
    fn dirty_destruction_is_never_capped() {
        let (factories, vms) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        let hints = GrabHints::capped(3);
        for i in 0..10 {
            let dirty = local_node(i + 1);
            assert!(vms.mark_dirty(&dirty).unwrap());

            assert_eq!(
                factories.grab(&me, &hints).unwrap(),
                GrabResponse::DestroyDirty(dirty)
            );
            assert!(factories.finish(&me).unwrap());

            let err = factories.finish(&me).unwrap_err();
            assert!(matches!(err, CoordinationError::ProtocolState { .. }));
        }
    }

    #[test]
    fn unregister_mid_destruction_requeues_the_dirty_vm() {
        let (factories, vms) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        let dirty = local_node(1);
        assert!(vms.mark_dirty(&dirty).unwrap());
        assert_eq!(
            factories.grab(&me, &GrabHints::capped(2)).unwrap(),
            GrabResponse::DestroyDirty(dirty.clone())
        );

        assert!(factories.unregister(&me).unwrap());

        // A fresh factory still receives the vm exactly once.
        let other = local_node(2);
        assert!(factories.register(&other).unwrap());
        assert_eq!(
            factories.grab(&other, &GrabHints::capped(2)).unwrap(),
            GrabResponse::DestroyDirty(dirty)
        );
    }

    #[test]
    fn unregister_mid_build_releases_the_slot() {
        let (factories, _) = coordinator();
        let me = local_node(0);
        assert!(factories.register(&me).unwrap());

        let hints = GrabHints::capped(1);
        assert_eq!(factories.grab(&me, &hints).unwrap(), GrabResponse::BuildClean);
        assert!(factories.unregister(&me).unwrap());

        let other = local_node(1);
        assert!(factories.register(&other).unwrap());
        assert_eq!(factories.grab(&other, &hints).unwrap(), GrabResponse::BuildClean);
    }
}
