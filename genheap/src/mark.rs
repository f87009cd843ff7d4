use crossbeam_deque::Worker;

use crate::cell::{CellKind, CellRef, HeapSlot, SlotAcceptor};
use crate::constants;
use crate::heap::Shared;
use crate::rawptr::CellPtr;
use crate::roots::{RootSet, RootVisitor};
use crate::segment::{HeapSegment, SegmentMeta};
use crate::value::{SymbolId, Value};
use crate::weakref::{WeakRefTable, WeakSlotId};
use crate::worklist::MarkWorklist;

/// Old generation marking state, owned by whichever thread runs the cycle.
///
/// A cell is marked when it is pushed, so each cell is traced at most once.
/// Young cells are never marked or traced: their mark bits are all set
/// outside of young collections and the cycle starts with an empty young
/// generation.
pub(crate) struct MarkAcceptor {
    local: Worker<CellPtr>,
    weak_maps: Vec<CellPtr>,
    symbols: Vec<bool>,
    young_base: usize,
    marked_cells: usize,
}

/// A marker paired with the weak reference table it is allowed to touch
struct Marking<'a> {
    marker: &'a mut MarkAcceptor,
    weak: &'a mut WeakRefTable,
}

impl<'a> SlotAcceptor for Marking<'a> {
    fn accept(&mut self, slot: HeapSlot) {
        self.marker.accept_value(slot.load());
    }

    /// Entries are resolved by `complete_weak_map_marking` once marking is done
    fn accept_weak_map_entry(&mut self, _key: HeapSlot, _value: HeapSlot) {}

    fn accept_weak_slot(&mut self, slot: WeakSlotId) {
        self.weak.mark(slot);
    }
}

impl<'a> RootVisitor for Marking<'a> {
    fn visit(&mut self, root: &mut Value) {
        self.marker.accept_value(*root);
    }

    fn visit_weak(&mut self, slot: WeakSlotId) {
        self.weak.mark(slot);
    }
}

/// Walks young cells for the symbols and weak slots they hold. Cell pointers
/// are ignored.
struct YoungMetadata<'a> {
    marker: &'a mut MarkAcceptor,
    weak: &'a mut WeakRefTable,
}

impl<'a> SlotAcceptor for YoungMetadata<'a> {
    fn accept(&mut self, slot: HeapSlot) {
        if let Value::Symbol(symbol) = slot.load() {
            self.marker.mark_symbol(symbol);
        }
    }

    fn accept_weak_slot(&mut self, slot: WeakSlotId) {
        self.weak.mark(slot);
    }
}

impl MarkAcceptor {
    pub fn new(young_base: usize, symbol_count: usize) -> MarkAcceptor {
        MarkAcceptor {
            local: Worker::new_lifo(),
            weak_maps: Vec::new(),
            symbols: vec![false; symbol_count],
            young_base,
            marked_cells: 0,
        }
    }

    fn in_young(&self, cell: CellPtr) -> bool {
        cell.segment_base() == self.young_base
    }

    fn is_marked(&self, cell: CellPtr) -> bool {
        self.in_young(cell) || unsafe { SegmentMeta::of(cell.as_word()) }.is_marked(cell)
    }

    pub fn marked_cells(&self) -> usize {
        self.marked_cells
    }

    pub fn mark_symbol(&mut self, symbol: SymbolId) {
        if let Some(live) = self.symbols.get_mut(symbol.0 as usize) {
            *live = true;
        }
    }

    pub fn accept_value(&mut self, value: Value) {
        match value {
            Value::Cell(cell) => self.accept_cell(cell),
            Value::Symbol(symbol) => self.mark_symbol(symbol),
            Value::Int(_) | Value::Empty => {}
        }
    }

    fn accept_cell(&mut self, cell: CellPtr) {
        if self.in_young(cell) {
            return;
        }
        let meta = unsafe { SegmentMeta::of(cell.as_word()) };
        if meta.is_marked(cell) {
            return;
        }
        meta.mark(cell);
        self.marked_cells += 1;

        match CellRef::new(cell).kind() {
            CellKind::WeakMap => self.weak_maps.push(cell),
            CellKind::Freelist => panic!("reached free cell {:?} while marking", cell),
            _ => self.local.push(cell),
        }
    }

    /// Mark everything the runtime roots directly
    pub fn mark_roots(&mut self, roots: &mut dyn RootSet, weak: &mut WeakRefTable) {
        roots.visit_roots(&mut Marking { marker: self, weak });
    }

    /// Trace up to one chunk of cells from the private worklist, then pull in
    /// whatever the barriers pushed to the global one
    fn drain_chunk(&mut self, worklist: &MarkWorklist, weak: &mut WeakRefTable) {
        for _ in 0..constants::MARK_CHUNK {
            let cell = match self.local.pop() {
                Some(cell) => cell,
                None => break,
            };
            CellRef::new(cell).trace(&mut Marking {
                marker: &mut *self,
                weak: &mut *weak,
            });
        }
        worklist.drain(|value| self.accept_value(value));
    }

    /// Drain concurrently with the mutator, holding the heap locks for one
    /// chunk at a time
    pub fn drain(&mut self, shared: &Shared) {
        loop {
            let old_gen = shared.old_gen.lock();
            let mut weak = shared.weak_refs.lock();
            self.drain_chunk(&shared.worklist, &mut weak);
            drop(weak);
            drop(old_gen);

            if self.local.is_empty() {
                break;
            }
        }
    }

    /// Drain to completion. The caller holds the heap locks and has stopped
    /// the mutator, so nothing can refill the worklists behind us.
    pub fn drain_locked(&mut self, worklist: &MarkWorklist, weak: &mut WeakRefTable) {
        loop {
            self.drain_chunk(worklist, weak);
            if self.local.is_empty() && worklist.is_empty() {
                break;
            }
        }
    }

    /// A key is live if it is not a cell, is young, or got marked
    fn is_live_key(&self, key: Value) -> bool {
        match key {
            Value::Cell(cell) => self.is_marked(cell),
            _ => true,
        }
    }

    fn needs_marking(&self, value: Value) -> bool {
        match value {
            Value::Cell(cell) => !self.is_marked(cell),
            Value::Symbol(symbol) => self
                .symbols
                .get(symbol.0 as usize)
                .map_or(false, |live| !*live),
            Value::Int(_) | Value::Empty => false,
        }
    }

    /// Resolve weak maps reached during marking: a value is retained while
    /// its key is live, which can make further keys live, so iterate to a
    /// fixed point. Entries whose key died are then cleared.
    pub fn complete_weak_map_marking(&mut self, worklist: &MarkWorklist, weak: &mut WeakRefTable) {
        loop {
            let mut newly_marked = false;
            let mut index = 0;
            // marking a value can reach more weak maps
            while index < self.weak_maps.len() {
                let map = CellRef::new(self.weak_maps[index]);
                for entry in 0..map.payload_words() / 2 {
                    let key = map.slot(entry * 2).load();
                    if key.is_empty() || !self.is_live_key(key) {
                        continue;
                    }
                    let value = map.slot(entry * 2 + 1).load();
                    if self.needs_marking(value) {
                        self.accept_value(value);
                        self.drain_locked(worklist, weak);
                        newly_marked = true;
                    }
                }
                index += 1;
            }
            if !newly_marked {
                break;
            }
        }

        for map in self.weak_maps.iter() {
            let map = CellRef::new(*map);
            for entry in 0..map.payload_words() / 2 {
                let key = map.slot(entry * 2);
                if let Value::Cell(cell) = key.load() {
                    if !self.is_marked(cell) {
                        key.store(Value::Empty);
                        map.slot(entry * 2 + 1).store(Value::Empty);
                    }
                }
            }
        }
    }

    /// Young cells are not traced by the old generation marker, but the
    /// symbols and weak slots they hold must survive the cycle
    pub fn mark_young_gen_metadata(&mut self, young: &HeapSegment, weak: &mut WeakRefTable) {
        young.for_each_cell(|cell| {
            cell.trace(&mut YoungMetadata {
                marker: &mut *self,
                weak: &mut *weak,
            })
        });
    }

    pub fn take_symbols(&mut self) -> Vec<bool> {
        std::mem::take(&mut self.symbols)
    }
}
