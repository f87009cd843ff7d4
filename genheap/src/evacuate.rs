use fnv::FnvHashMap;
use parking_lot::MutexGuard;

use crate::cell::{CellRef, HeapSlot, SlotAcceptor};
use crate::heap::Shared;
use crate::oldgen::{fatal_out_of_memory, old_gen_alloc, OldGen};
use crate::rawptr::CellPtr;
use crate::roots::RootVisitor;
use crate::value::Value;

/// Young generation evacuation: copies every young cell it is shown into the
/// old generation and rewrites the slot or root that pointed at it.
///
/// Forwarding addresses live in a side table rather than in the young cell,
/// which stays intact until the young generation is reset.
pub(crate) struct EvacAcceptor<'a, 'g> {
    shared: &'a Shared,
    old_gen: &'a mut MutexGuard<'g, OldGen>,
    young_finalizables: &'a [CellPtr],
    forwarding: FnvHashMap<CellPtr, CellPtr>,
    copy_list: Vec<CellPtr>,
    evacuated_bytes: usize,
}

impl<'a, 'g> EvacAcceptor<'a, 'g> {
    pub fn new(
        shared: &'a Shared,
        old_gen: &'a mut MutexGuard<'g, OldGen>,
        young_finalizables: &'a [CellPtr],
    ) -> EvacAcceptor<'a, 'g> {
        EvacAcceptor {
            shared,
            old_gen,
            young_finalizables,
            forwarding: FnvHashMap::default(),
            copy_list: Vec::new(),
            evacuated_bytes: 0,
        }
    }

    fn evacuate(&mut self, value: Value) -> Value {
        match value {
            Value::Cell(cell) if self.shared.in_young(cell.as_word()) => Value::Cell(self.forward(cell)),
            _ => value,
        }
    }

    fn forward(&mut self, cell: CellPtr) -> CellPtr {
        if let Some(new) = self.forwarding.get(&cell) {
            return *new;
        }

        let source = CellRef::new(cell);
        let size = source.size();
        let (dest, taken) = match old_gen_alloc(self.shared, &mut *self.old_gen, size) {
            Some(allocation) => allocation,
            None => fatal_out_of_memory(
                self.shared,
                &self.old_gen,
                self.young_finalizables,
                Some(&self.forwarding),
            ),
        };

        source.copy_to(dest);
        if taken > size {
            CellRef::new(dest).grow_to(taken);
        }

        self.shared.young.meta().mark(cell);
        self.forwarding.insert(cell, dest);
        self.copy_list.push(dest);
        self.evacuated_bytes += size;
        dest
    }

    /// Old generation slots on dirty cards are roots for the young generation
    pub fn scan_dirty_cards(&mut self) {
        // segments added by evacuation below start with clean cards
        let segment_count = self.old_gen.segments.len();
        for index in 0..segment_count {
            let slots = self.old_gen.segments[index].dirty_card_slots();
            log::trace!("segment {}: {} slots on dirty cards", index, slots.len());
            for slot in slots {
                self.accept(slot);
            }
        }
        for segment in self.old_gen.segments.iter() {
            segment.meta().cards.clear();
        }
    }

    /// Trace the copies until no young cell is left unforwarded
    pub fn drain_copy_list(&mut self) {
        while let Some(copy) = self.copy_list.pop() {
            CellRef::new(copy).trace(self);
        }
    }

    /// The forwarding table and the number of bytes copied
    pub fn finish(self) -> (FnvHashMap<CellPtr, CellPtr>, usize) {
        debug_assert!(self.copy_list.is_empty());
        (self.forwarding, self.evacuated_bytes)
    }
}

impl<'a, 'g> SlotAcceptor for EvacAcceptor<'a, 'g> {
    fn accept(&mut self, slot: HeapSlot) {
        let value = slot.load();
        let moved = self.evacuate(value);
        if moved != value {
            slot.store(moved);
        }
    }
}

impl<'a, 'g> RootVisitor for EvacAcceptor<'a, 'g> {
    fn visit(&mut self, root: &mut Value) {
        *root = self.evacuate(*root);
    }
}
