use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cell::{CellKind, CellRef, CellView, HeapSlot};
use crate::config::GcConfig;
use crate::constants;
use crate::error::{ErrorKind, HeapError};
use crate::oldgen::{
    fatal_out_of_memory, finalize_all, old_gen_alloc, start_old_gen_collection, wait_for_collection,
    OldGen,
};
use crate::phase::{AtomicPhase, Phase};
use crate::rawptr::CellPtr;
use crate::roots::{RootSet, RootVisitor};
use crate::segment::{Generation, HeapSegment, SegmentMeta};
use crate::stats::{GcStats, HeapInfo};
use crate::value::Value;
use crate::weakref::{WeakRefTable, WeakSlotId, WeakSlotState};
use crate::worklist::MarkWorklist;

/// Runtime callback for cells allocated with `HasFinalizer::Yes`. May be
/// called on the marker thread.
pub type FinalizerHook = Box<dyn Fn(&CellView) + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HasFinalizer {
    No,
    Yes,
}

/// State shared between the mutator and the marker thread.
///
/// Lock order: stop-the-world flag, then old generation, then weak
/// references.
pub(crate) struct Shared {
    pub config: GcConfig,
    pub phase: AtomicPhase,
    /// Written only by the mutator, read by the marker while the world is
    /// stopped
    pub young: HeapSegment,
    pub old_gen: Mutex<OldGen>,
    /// Signalled when a cycle returns to `Phase::None`
    pub collection_done: Condvar,
    pub weak_refs: Mutex<WeakRefTable>,
    pub worklist: MarkWorklist,
    pub stats: Mutex<GcStats>,
    /// True while the mutator is parked inside the collector
    world_stopped: Mutex<bool>,
    world_changed: Condvar,
    finalizer: Option<FinalizerHook>,
    finalized_all: AtomicBool,
}

impl Shared {
    pub fn in_young(&self, addr: usize) -> bool {
        addr & constants::SEGMENT_PTR_MASK == self.young.base()
    }

    pub fn finalize(&self, cell: CellRef) {
        if let Some(hook) = &self.finalizer {
            hook(&CellView::new(cell));
        }
    }

    /// Returns whether finalize-all already happened
    pub fn mark_finalized_all(&self) -> bool {
        self.finalized_all.swap(true, Ordering::AcqRel)
    }

    /// Keep an old generation value alive through the current mark
    pub fn snapshot_barrier(&self, old: Value) {
        match old {
            Value::Cell(cell) if !self.in_young(cell.as_word()) => self.worklist.enqueue(old),
            Value::Symbol(_) => self.worklist.enqueue(old),
            _ => {}
        }
    }

    /// Park the mutator: the marker may now take its stop-the-world steps
    pub fn yield_to_background(&self) {
        let mut stopped = self.world_stopped.lock();
        *stopped = true;
        self.world_changed.notify_all();
    }

    /// Resume the mutator, waiting out any stop-the-world step in progress
    pub fn yield_to_mutator(&self) {
        *self.world_stopped.lock() = false;
    }

    /// Marker side of the handshake. The mutator stays parked until the
    /// returned guard is dropped.
    pub fn wait_for_world_stopped(&self) -> MutexGuard<'_, bool> {
        let mut stopped = self.world_stopped.lock();
        while !*stopped {
            self.world_changed.wait(&mut stopped);
        }
        stopped
    }
}

/// A field of a cell, the unit write barriers operate on
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Field {
    slot: HeapSlot,
}

impl Field {
    pub fn addr(&self) -> usize {
        self.slot.addr()
    }
}

/// The runtime's roots plus a weak slot that no cell owns yet
struct PendingWeakSlot<'r> {
    roots: &'r mut dyn RootSet,
    slot: WeakSlotId,
}

impl<'r> RootSet for PendingWeakSlot<'r> {
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor) {
        self.roots.visit_roots(visitor);
        visitor.visit_weak(self.slot);
    }

    fn symbol_count(&self) -> usize {
        self.roots.symbol_count()
    }

    fn free_symbols(&mut self, live: &[bool]) {
        self.roots.free_symbols(live)
    }
}

/// The collector. The owner of this handle is the mutator: allocation,
/// barriers and collections all go through it, while a marker thread may be
/// working on the old generation in the background.
///
/// Any call that takes a `RootSet` may run a young collection, which moves
/// young cells. Cell pointers held outside the root set are stale afterwards.
pub struct Heap {
    shared: Arc<Shared>,
    /// Finalizable cells in the young generation, in allocation order
    young_finalizables: Vec<CellPtr>,
}

impl Heap {
    pub fn new(config: GcConfig) -> Result<Heap, HeapError> {
        Heap::build(config, None)
    }

    pub fn with_finalizer<F>(config: GcConfig, finalizer: F) -> Result<Heap, HeapError>
    where
        F: Fn(&CellView) + Send + Sync + 'static,
    {
        Heap::build(config, Some(Box::new(finalizer)))
    }

    fn build(config: GcConfig, finalizer: Option<FinalizerHook>) -> Result<Heap, HeapError> {
        config.validate()?;

        let young = HeapSegment::new(Generation::Young)?;
        young.meta().mark_bits.mark_all();
        let old_gen = OldGen::new(config.init_old_segments())?;

        log::debug!(
            "heap: young segment at {:#x}, {} old segments, max {} bytes, {}",
            young.base(),
            old_gen.segments.len(),
            config.max_heap_size,
            if config.concurrent { "concurrent" } else { "incremental" }
        );

        Ok(Heap {
            shared: Arc::new(Shared {
                config,
                phase: AtomicPhase::new(),
                young,
                old_gen: Mutex::new(old_gen),
                collection_done: Condvar::new(),
                weak_refs: Mutex::new(WeakRefTable::new()),
                worklist: MarkWorklist::new(),
                stats: Mutex::new(GcStats::default()),
                world_stopped: Mutex::new(false),
                world_changed: Condvar::new(),
                finalizer,
                finalized_all: AtomicBool::new(false),
            }),
            young_finalizables: Vec::new(),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn young_finalizables_mut(&mut self) -> &mut Vec<CellPtr> {
        &mut self.young_finalizables
    }

    fn checked_size(kind: CellKind, payload_bytes: usize) -> Result<usize, HeapError> {
        if kind == CellKind::Freelist {
            return Err(HeapError::new(ErrorKind::BadAllocationRequest));
        }
        if payload_bytes > constants::MAX_CELL_SIZE - constants::HEADER_SIZE {
            return Err(HeapError::new(ErrorKind::AllocationTooLarge {
                requested: payload_bytes.saturating_add(constants::HEADER_SIZE),
                max: constants::MAX_CELL_SIZE,
            }));
        }
        Ok(constants::cell_size_for(payload_bytes))
    }

    /// Allocate a cell with `payload_bytes` of zeroed payload. Small cells
    /// go to the young generation, running one young collection if it is
    /// full; large ones go straight to the old generation.
    pub fn alloc(
        &mut self,
        roots: &mut dyn RootSet,
        kind: CellKind,
        payload_bytes: usize,
        finalizer: HasFinalizer,
    ) -> Result<CellPtr, HeapError> {
        let size = Heap::checked_size(kind, payload_bytes)?;
        if size >= self.shared.config.large_object_threshold {
            return Ok(self.alloc_old(roots, kind, size, finalizer));
        }

        let cell = match self.shared.young.bump_alloc(size) {
            Some(cell) => cell,
            None => {
                self.young_gen_collection(roots);
                match self.shared.young.bump_alloc(size) {
                    Some(cell) => cell,
                    None => panic!("young generation cannot fit {} bytes after a collection", size),
                }
            }
        };

        CellRef::initialize(cell, kind, size, finalizer == HasFinalizer::Yes);
        if finalizer == HasFinalizer::Yes {
            self.young_finalizables.push(cell);
        }
        Ok(cell)
    }

    /// Allocate directly in the old generation, for cells expected to live
    /// long
    pub fn alloc_long_lived(
        &mut self,
        roots: &mut dyn RootSet,
        kind: CellKind,
        payload_bytes: usize,
        finalizer: HasFinalizer,
    ) -> Result<CellPtr, HeapError> {
        let size = Heap::checked_size(kind, payload_bytes)?;
        Ok(self.alloc_old(roots, kind, size, finalizer))
    }

    fn alloc_old(
        &mut self,
        roots: &mut dyn RootSet,
        kind: CellKind,
        size: usize,
        finalizer: HasFinalizer,
    ) -> CellPtr {
        if let Some(cell) = self.try_alloc_old(kind, size, finalizer) {
            return cell;
        }
        self.collect(roots);
        if let Some(cell) = self.try_alloc_old(kind, size, finalizer) {
            return cell;
        }

        let shared = Arc::clone(&self.shared);
        let old_gen = shared.old_gen.lock();
        fatal_out_of_memory(&shared, &old_gen, &self.young_finalizables, None)
    }

    fn try_alloc_old(&mut self, kind: CellKind, size: usize, finalizer: HasFinalizer) -> Option<CellPtr> {
        let shared = &*self.shared;
        shared.yield_to_background();
        let cell = {
            let mut old_gen = shared.old_gen.lock();
            old_gen_alloc(shared, &mut old_gen, size).map(|(cell, taken)| {
                // initialized before the lock is released so sweeps and card
                // scans always see a whole cell
                CellRef::initialize(cell, kind, taken, finalizer == HasFinalizer::Yes);
                cell
            })
        };
        shared.yield_to_mutator();
        cell
    }

    pub fn alloc_object(
        &mut self,
        roots: &mut dyn RootSet,
        slots: usize,
        finalizer: HasFinalizer,
    ) -> Result<CellPtr, HeapError> {
        self.alloc(roots, CellKind::Object, slots * constants::HEAP_ALIGN, finalizer)
    }

    pub fn alloc_bytes(&mut self, roots: &mut dyn RootSet, len: usize) -> Result<CellPtr, HeapError> {
        self.alloc(roots, CellKind::Bytes, len, HasFinalizer::No)
    }

    pub fn alloc_weak_map(&mut self, roots: &mut dyn RootSet, entries: usize) -> Result<CellPtr, HeapError> {
        self.alloc(roots, CellKind::WeakMap, entries * 2 * constants::HEAP_ALIGN, HasFinalizer::No)
    }

    /// Allocate a weak slot observing `target` and a cell that owns it. The
    /// target must be reachable from `roots` if it should survive.
    pub fn alloc_weak_ref(&mut self, roots: &mut dyn RootSet, target: Value) -> Result<CellPtr, HeapError> {
        // the slot first: a young collection during the cell allocation
        // forwards it along with the target
        let slot = self.alloc_weak_slot(target);
        let mut pending = PendingWeakSlot { roots, slot };
        let cell = match self.alloc(&mut pending, CellKind::WeakRef, constants::HEAP_ALIGN, HasFinalizer::No) {
            Ok(cell) => cell,
            Err(e) => {
                self.free_weak_slot(slot);
                return Err(e);
            }
        };
        CellRef::new(cell).set_weak_slot(slot);
        Ok(cell)
    }

    /// The weak slot owned by a `WeakRef` cell
    pub fn weak_ref_slot(&self, cell: CellPtr) -> Option<WeakSlotId> {
        let cell = CellRef::new(cell);
        assert_eq!(cell.kind(), CellKind::WeakRef, "not a weak ref cell");
        cell.weak_slot()
    }

    pub fn kind(&self, cell: CellPtr) -> CellKind {
        CellRef::new(cell).kind()
    }

    pub fn slot_count(&self, cell: CellPtr) -> usize {
        CellRef::new(cell).payload_words()
    }

    pub fn view(&self, cell: CellPtr) -> CellView<'_> {
        CellView::new(CellRef::new(cell))
    }

    /// Address a field of an `Object` cell for use with the barrier calls.
    /// Weak map entries are only reachable through the `weak_map_*` calls,
    /// which run the read barrier; other kinds hold no traced fields.
    pub fn field(&self, cell: CellPtr, index: usize) -> Field {
        let kind = CellRef::new(cell).kind();
        assert_eq!(kind, CellKind::Object, "field access to a {} cell", kind.name());
        self.any_field(cell, index)
    }

    fn any_field(&self, cell: CellPtr, index: usize) -> Field {
        let cell = CellRef::new(cell);
        assert!(
            index < cell.payload_words(),
            "field {} out of bounds for {:?}",
            index,
            cell.header()
        );
        Field {
            slot: cell.slot(index),
        }
    }

    pub fn load(&self, cell: CellPtr, index: usize) -> Value {
        self.field(cell, index).slot.load()
    }

    /// Overwrite a field, running the write barrier first
    pub fn store(&self, cell: CellPtr, index: usize, value: Value) {
        let field = self.field(cell, index);
        self.write_barrier(field, value);
        field.slot.store(value);
    }

    /// First write to a field of a fresh cell
    pub fn init(&self, cell: CellPtr, index: usize, value: Value) {
        let field = self.field(cell, index);
        self.constructor_write_barrier(field, value);
        field.slot.store(value);
    }

    fn raw_cell(&self, cell: CellPtr, index: usize) -> CellRef {
        let cell = CellRef::new(cell);
        assert_eq!(cell.kind(), CellKind::Bytes, "raw access to a traced cell");
        assert!(index < cell.payload_words(), "raw word {} out of bounds", index);
        cell
    }

    pub fn load_raw(&self, cell: CellPtr, index: usize) -> usize {
        self.raw_cell(cell, index).raw(index)
    }

    pub fn store_raw(&self, cell: CellPtr, index: usize, word: usize) {
        self.raw_cell(cell, index).set_raw(index, word)
    }

    /// Must run before every overwrite of a field. Young fields need no
    /// tracking. While marking, the value about to be overwritten is kept
    /// alive; an old field that will point into the young generation gets
    /// its card dirtied.
    pub fn write_barrier(&self, field: Field, value: Value) {
        if self.shared.in_young(field.addr()) {
            return;
        }
        if self.shared.phase.load() == Phase::Mark {
            self.shared.snapshot_barrier(field.slot.load());
        }
        self.generational_barrier(field, value);
    }

    /// Must run before the first write to a field. Nothing can have been
    /// overwritten so only the card table is maintained.
    pub fn constructor_write_barrier(&self, field: Field, value: Value) {
        if self.shared.in_young(field.addr()) {
            return;
        }
        self.generational_barrier(field, value);
    }

    fn generational_barrier(&self, field: Field, value: Value) {
        if let Value::Cell(cell) = value {
            if self.shared.in_young(cell.as_word()) {
                unsafe { SegmentMeta::of(field.addr()) }
                    .cards
                    .dirty_card_for_address(field.addr());
            }
        }
    }

    /// Find the entry for `key`, or the first free one
    fn weak_map_entry(&self, map: CellPtr, key: Value) -> (Option<usize>, Option<usize>) {
        let cell = CellRef::new(map);
        assert_eq!(cell.kind(), CellKind::WeakMap, "not a weak map");
        let mut free = None;
        for entry in 0..cell.payload_words() / 2 {
            let current = cell.slot(entry * 2).load();
            if current == key {
                return (Some(entry), free);
            }
            if current.is_empty() && free.is_none() {
                free = Some(entry);
            }
        }
        (None, free)
    }

    /// Associate `value` with `key`. Returns false when the map is full.
    pub fn weak_map_set(&self, map: CellPtr, key: Value, value: Value) -> bool {
        assert!(!key.is_empty(), "empty weak map key");
        match self.weak_map_entry(map, key) {
            (Some(entry), _) => {
                self.store_entry(map, entry * 2 + 1, value);
                true
            }
            (None, Some(entry)) => {
                self.store_entry(map, entry * 2, key);
                self.store_entry(map, entry * 2 + 1, value);
                true
            }
            (None, None) => false,
        }
    }

    pub fn weak_map_get(&self, map: CellPtr, key: Value) -> Option<Value> {
        match self.weak_map_entry(map, key) {
            (Some(entry), _) if !key.is_empty() => {
                let value = self.any_field(map, entry * 2 + 1).slot.load();
                self.weak_read_barrier(value);
                Some(value)
            }
            _ => None,
        }
    }

    /// The keys present in a weak map. Like any weak read, each key handed
    /// out while marking is kept alive for the rest of the cycle.
    pub fn weak_map_keys(&self, map: CellPtr) -> Vec<Value> {
        let cell = CellRef::new(map);
        assert_eq!(cell.kind(), CellKind::WeakMap, "not a weak map");
        let keys: Vec<Value> = (0..cell.payload_words() / 2)
            .map(|entry| cell.slot(entry * 2).load())
            .filter(|key| !key.is_empty())
            .collect();
        for key in keys.iter() {
            self.weak_read_barrier(*key);
        }
        keys
    }

    fn store_entry(&self, map: CellPtr, index: usize, value: Value) {
        let field = self.any_field(map, index);
        self.write_barrier(field, value);
        field.slot.store(value);
    }

    /// A weakly held value escaping to the mutator during marking must
    /// survive the cycle
    fn weak_read_barrier(&self, value: Value) {
        if self.shared.phase.load() == Phase::Mark {
            self.shared.snapshot_barrier(value);
        }
    }

    /// Create a weak slot. While marking, the slot and its value count as
    /// live for the current cycle.
    ///
    /// A slot survives an old generation cycle only if the runtime reports
    /// it through `RootVisitor::visit_weak` or a live `WeakRef` cell owns
    /// it. Unreferenced slots are freed at the end of marking.
    pub fn alloc_weak_slot(&self, initial: Value) -> WeakSlotId {
        let mut weak = self.shared.weak_refs.lock();
        let marking = self.shared.phase.load() == Phase::Mark;
        if marking {
            self.shared.snapshot_barrier(initial);
        }
        weak.alloc(initial, marking)
    }

    /// Read a weak slot. A value read while marking is kept alive for the
    /// rest of the cycle.
    pub fn weak_ref_read(&self, slot: WeakSlotId) -> Value {
        let weak = self.shared.weak_refs.lock();
        let value = weak.get(slot);
        self.weak_read_barrier(value);
        value
    }

    pub fn free_weak_slot(&self, slot: WeakSlotId) {
        self.shared.weak_refs.lock().free(slot);
    }

    pub fn weak_slot_state(&self, slot: WeakSlotId) -> WeakSlotState {
        self.shared.weak_refs.lock().state(slot)
    }

    /// Full collection: a young collection, then an old generation cycle
    /// from the current roots, waited for.
    pub fn collect(&mut self, roots: &mut dyn RootSet) {
        let mut fresh = self.young_gen_collection(roots);

        let shared = Arc::clone(&self.shared);
        shared.yield_to_background();
        {
            let mut old_gen = shared.old_gen.lock();
            loop {
                if shared.phase.load() == Phase::None {
                    if fresh {
                        break;
                    }
                    // a cycle that was already running started from an
                    // older snapshot, so run one of our own after it
                    start_old_gen_collection(&shared, &mut old_gen, roots);
                    fresh = true;
                }
                wait_for_collection(&shared, &mut old_gen);
            }
        }
        shared.yield_to_mutator();
        self.deliver_symbol_liveness(roots);
    }

    /// Run a young collection and start an old generation cycle without
    /// waiting for it
    pub fn begin_old_gen_collection(&mut self, roots: &mut dyn RootSet) {
        if self.young_gen_collection(roots) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        shared.yield_to_background();
        {
            let mut old_gen = shared.old_gen.lock();
            if shared.phase.load() == Phase::None {
                start_old_gen_collection(&shared, &mut old_gen, roots);
            }
        }
        shared.yield_to_mutator();
    }

    /// Block until no old generation cycle is active
    pub fn wait_for_collection(&mut self, roots: &mut dyn RootSet) {
        let shared = &*self.shared;
        shared.yield_to_background();
        wait_for_collection(shared, &mut shared.old_gen.lock());
        shared.yield_to_mutator();
        self.deliver_symbol_liveness(roots);
    }

    /// Hand symbol liveness from a finished cycle to the runtime
    pub(crate) fn deliver_symbol_liveness(&mut self, roots: &mut dyn RootSet) {
        let live = self.shared.old_gen.lock().symbol_liveness.take();
        if let Some(live) = live {
            roots.free_symbols(&live);
        }
    }

    /// Visit every allocated cell, young and old, once any running cycle has
    /// finished
    pub fn for_all_live_objects<F>(&mut self, mut f: F)
    where
        F: FnMut(&CellView),
    {
        let shared = &*self.shared;
        shared.yield_to_background();
        {
            let mut old_gen = shared.old_gen.lock();
            wait_for_collection(shared, &mut old_gen);
            shared.young.for_each_cell(|cell| f(&CellView::new(cell)));
            for segment in old_gen.segments.iter() {
                segment.for_each_cell(|cell| {
                    if cell.kind() != CellKind::Freelist {
                        f(&CellView::new(cell));
                    }
                });
            }
        }
        shared.yield_to_mutator();
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase.load()
    }

    pub fn in_young_gen(&self, cell: CellPtr) -> bool {
        self.shared.in_young(cell.as_word())
    }

    pub fn in_old_gen(&self, cell: CellPtr) -> bool {
        self.shared.old_gen.lock().contains(cell.as_word())
    }

    pub fn is_marked(&self, cell: CellPtr) -> bool {
        unsafe { SegmentMeta::of(cell.as_word()) }.is_marked(cell)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.shared.young.used() + self.shared.old_gen.lock().allocated_bytes()
    }

    pub fn heap_size(&self) -> usize {
        (self.shared.old_gen.lock().segments.len() + 1) * constants::SEGMENT_SIZE
    }

    pub fn heap_info(&self) -> HeapInfo {
        let young_used = self.shared.young.used();
        let (old_gen_allocated, old_gen_segments) = {
            let old_gen = self.shared.old_gen.lock();
            (old_gen.allocated_bytes(), old_gen.segments.len())
        };
        let weak_slots_in_use = self.shared.weak_refs.lock().in_use();

        HeapInfo {
            allocated_bytes: young_used + old_gen_allocated,
            heap_size: (old_gen_segments + 1) * constants::SEGMENT_SIZE,
            young_used,
            old_gen_allocated,
            old_gen_segments,
            weak_slots_in_use,
        }
    }

    pub fn stats(&self) -> GcStats {
        self.shared.stats.lock().clone()
    }

    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let shared = &*self.shared;
        shared.yield_to_background();
        let mut old_gen = shared.old_gen.lock();
        wait_for_collection(shared, &mut old_gen);
        finalize_all(shared, &old_gen, &self.young_finalizables, None);
    }
}
