use std::sync::Arc;

use crate::cell::{CellRef, HeapSlot, SlotAcceptor};
use crate::evacuate::EvacAcceptor;
use crate::heap::{Heap, Shared};
use crate::oldgen::{start_old_gen_collection, OldGen};
use crate::phase::Phase;
use crate::roots::RootSet;
use crate::segment::{Generation, SegmentMeta};
use crate::stats::CollectionSection;
use crate::value::Value;

/// Debug build check of the old generation around a young collection.
/// Before evacuation every old slot pointing into the young generation must
/// sit on a dirty card; afterwards no such slot may remain.
struct OldGenVerifier<'a> {
    shared: &'a Shared,
    evacuated: bool,
}

impl<'a> OldGenVerifier<'a> {
    fn run(shared: &'a Shared, old_gen: &OldGen, evacuated: bool) {
        let mut verifier = OldGenVerifier { shared, evacuated };
        for segment in old_gen.segments.iter() {
            let meta = segment.meta();
            assert_eq!(meta.base, segment.base(), "segment metadata is misplaced");
            assert_eq!(meta.generation, Generation::Old);
            segment.for_each_cell(|cell| cell.trace(&mut verifier));
        }
    }
}

impl<'a> SlotAcceptor for OldGenVerifier<'a> {
    fn accept(&mut self, slot: HeapSlot) {
        let young = match slot.load() {
            Value::Cell(cell) if self.shared.in_young(cell.as_word()) => cell,
            _ => return,
        };
        assert!(
            !self.evacuated,
            "old slot {:#x} still points at young cell {:?} after evacuation",
            slot.addr(),
            young
        );
        let meta = unsafe { SegmentMeta::of(slot.addr()) };
        assert!(
            meta.cards.is_card_for_address_dirty(slot.addr()),
            "old slot {:#x} points at young cell {:?} from a clean card",
            slot.addr(),
            young
        );
    }
}

impl Heap {
    /// Evacuate every reachable young cell into the old generation and empty
    /// the young generation. Roots are old generation slots on dirty cards
    /// and whatever `roots` visits; both are rewritten to the copies.
    ///
    /// Starts an old generation cycle when occupancy has reached the
    /// configured target. Returns whether it did.
    pub(crate) fn young_gen_collection(&mut self, roots: &mut dyn RootSet) -> bool {
        let shared = Arc::clone(self.shared());
        let section = CollectionSection::new("young", shared.young.used());
        let finalizables = std::mem::take(self.young_finalizables_mut());

        shared.yield_to_background();
        let started_cycle = {
            let mut old_gen = shared.old_gen.lock();
            if cfg!(debug_assertions) {
                OldGenVerifier::run(&shared, &old_gen, false);
            }

            let (forwarding, evacuated_bytes) = {
                let mut evac = EvacAcceptor::new(&shared, &mut old_gen, &finalizables);
                roots.visit_roots(&mut evac);
                evac.scan_dirty_cards();
                evac.drain_copy_list();
                evac.finish()
            };
            if cfg!(debug_assertions) {
                OldGenVerifier::run(&shared, &old_gen, true);
            }

            shared.weak_refs.lock().update_for_young_gen(
                |cell| shared.in_young(cell.as_word()),
                |cell| forwarding.get(&cell).copied(),
                shared.phase.load() != Phase::None,
            );

            let mut finalized = 0;
            for cell in finalizables.iter() {
                if !forwarding.contains_key(cell) {
                    shared.finalize(CellRef::new(*cell));
                    finalized += 1;
                }
            }

            shared.young.reset_level();
            shared.young.meta().mark_bits.mark_all();

            let pause = section.finish(shared.young.used());
            shared.stats.lock().record_young(pause, evacuated_bytes, finalized);
            log::trace!(
                "young collection: {} cells evacuated, old generation at {:.2}",
                forwarding.len(),
                old_gen.occupancy()
            );

            if shared.phase.load() == Phase::None && old_gen.occupancy() >= shared.config.occupancy_target {
                start_old_gen_collection(&shared, &mut old_gen, roots);
                true
            } else {
                false
            }
        };
        shared.yield_to_mutator();

        self.deliver_symbol_liveness(roots);
        started_cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellKind;
    use crate::config::GcConfig;
    use crate::heap::HasFinalizer;
    use crate::roots::RootStack;

    fn heap() -> Heap {
        Heap::new(GcConfig::default().with_concurrent(false)).unwrap()
    }

    #[test]
    fn test_barriered_old_to_young_pointer_passes_verification() {
        let mut heap = heap();
        let mut roots = RootStack::new();
        let old = heap
            .alloc_long_lived(&mut roots, CellKind::Object, 16, HasFinalizer::No)
            .unwrap();
        roots.push(old.into());
        let young = heap.alloc_object(&mut roots, 1, HasFinalizer::No).unwrap();
        heap.store(old, 0, young.into());

        heap.young_gen_collection(&mut roots);
        let promoted = heap.load(old, 0).as_cell().unwrap();
        assert!(!heap.in_young_gen(promoted));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "from a clean card")]
    fn test_unrecorded_old_to_young_pointer_is_caught() {
        let mut heap = heap();
        let mut roots = RootStack::new();
        let old = heap
            .alloc_long_lived(&mut roots, CellKind::Object, 16, HasFinalizer::No)
            .unwrap();
        roots.push(old.into());
        let young = heap.alloc_object(&mut roots, 1, HasFinalizer::No).unwrap();
        // no write barrier
        CellRef::new(old).slot(0).store(young.into());

        heap.young_gen_collection(&mut roots);
    }
}
