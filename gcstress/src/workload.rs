use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use genheap::constants;
use genheap::{
    CellKind, CellPtr, GcConfig, GcStats, HasFinalizer, Heap, HeapInfo, RootStack, SymbolId, Value, WeakSlotId,
};

use crate::error::{err_corrupt, StressError};

/// Written to the first word of every bytes cell
const BYTES_MAGIC: usize = 0x5eed_b17e;
/// Weak slots held at once before the oldest is freed. Held slots are
/// reported to the collector as weak roots.
const MAX_WEAK_SLOTS: usize = 64;
const MAP_ENTRIES: usize = 16;
const MAX_OBJECT_REFS: usize = 8;

pub struct Options {
    pub iterations: u64,
    pub roots: usize,
    pub symbols: usize,
    pub seed: u64,
    /// Explicit collection interval in iterations, 0 for none
    pub collect_every: u64,
    pub finalizer_ratio: f64,
    pub large_ratio: f64,
}

pub struct Report {
    pub stats: GcStats,
    pub info: HeapInfo,
    pub allocations: u64,
    pub finalized: u64,
    pub dead_symbols: usize,
}

/// A small runtime: a root stack of random object graphs that it keeps
/// rewiring, a weak map, and a rolling window of weak slots
pub struct Workload {
    heap: Heap,
    roots: RootStack,
    rng: StdRng,
    weak_slots: VecDeque<WeakSlotId>,
    next_id: i64,
    allocations: u64,
    finalized: Arc<AtomicU64>,
    options: Options,
}

impl Workload {
    pub fn new(config: GcConfig, options: Options) -> Result<Workload, StressError> {
        let finalized = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&finalized);
        let mut heap = Heap::with_finalizer(config, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })?;

        let mut roots = RootStack::new();
        roots.set_symbol_count(options.symbols);
        let map = heap.alloc_weak_map(&mut roots, MAP_ENTRIES)?;
        roots.push(map.into());
        for _ in 0..options.roots {
            roots.push(Value::Empty);
        }

        Ok(Workload {
            heap,
            roots,
            rng: StdRng::seed_from_u64(options.seed),
            weak_slots: VecDeque::new(),
            next_id: 0,
            allocations: 0,
            finalized,
            options,
        })
    }

    pub fn run(mut self) -> Result<Report, StressError> {
        for iteration in 1..=self.options.iterations {
            self.step()?;

            if self.options.collect_every > 0 && iteration % self.options.collect_every == 0 {
                if self.rng.random_bool(0.5) {
                    log::debug!("iteration {}: full collection", iteration);
                    self.heap.collect(&mut self.roots);
                    self.verify()?;
                } else {
                    log::debug!("iteration {}: starting an old generation cycle", iteration);
                    self.heap.begin_old_gen_collection(&mut self.roots);
                }
            }
        }
        self.finish()
    }

    fn step(&mut self) -> Result<(), StressError> {
        match self.rng.random_range(0..10) {
            0..=4 => self.allocate_object(),
            5 | 6 => {
                self.rewire();
                Ok(())
            }
            7 => self.allocate_bytes(),
            8 => self.churn_weak_slots(),
            _ => self.update_weak_map(),
        }
    }

    fn random_root(&mut self) -> usize {
        // root 0 is the weak map
        self.rng.random_range(1..self.roots.len())
    }

    fn random_value(&mut self) -> Value {
        match self.rng.random_range(0..4) {
            0 => Value::Int(self.rng.random_range(-1000..1000)),
            1 if self.options.symbols > 0 => {
                Value::Symbol(SymbolId(self.rng.random_range(0..self.options.symbols) as u32))
            }
            _ => {
                let root = self.random_root();
                self.roots.get(root)
            }
        }
    }

    fn allocate_object(&mut self) -> Result<(), StressError> {
        let refs = self.rng.random_range(1..=MAX_OBJECT_REFS);
        let finalizer = if self.rng.random_bool(self.options.finalizer_ratio) {
            HasFinalizer::Yes
        } else {
            HasFinalizer::No
        };

        let cell = self.heap.alloc_object(&mut self.roots, refs + 1, finalizer)?;
        self.allocations += 1;
        self.heap.init(cell, 0, Value::Int(self.next_id));
        self.next_id += 1;
        for index in 1..=refs {
            let value = self.random_value();
            self.heap.init(cell, index, value);
        }

        let root = self.random_root();
        self.roots.set(root, cell.into());
        Ok(())
    }

    fn allocate_bytes(&mut self) -> Result<(), StressError> {
        let len = if self.rng.random_bool(self.options.large_ratio) {
            constants::DEFAULT_LARGE_OBJECT_THRESHOLD
        } else {
            self.rng.random_range(constants::HEAP_ALIGN..4096)
        };

        let cell = self.heap.alloc_bytes(&mut self.roots, len)?;
        self.allocations += 1;
        self.heap.store_raw(cell, 0, BYTES_MAGIC);

        let root = self.random_root();
        self.roots.set(root, cell.into());
        Ok(())
    }

    /// Overwrite a reference field of a rooted object
    fn rewire(&mut self) {
        let root = self.random_root();
        let cell = match self.roots.get(root).as_cell() {
            Some(cell) if self.heap.kind(cell) == CellKind::Object => cell,
            _ => return,
        };
        let index = self.rng.random_range(1..self.heap.slot_count(cell));
        let value = self.random_value();
        self.heap.store(cell, index, value);
    }

    fn churn_weak_slots(&mut self) -> Result<(), StressError> {
        let root = self.random_root();
        let slot = self.heap.alloc_weak_slot(self.roots.get(root));
        self.roots.push_weak(slot);
        self.weak_slots.push_back(slot);
        if self.weak_slots.len() > MAX_WEAK_SLOTS {
            if let Some(oldest) = self.weak_slots.pop_front() {
                self.roots.remove_weak(oldest);
                self.heap.free_weak_slot(oldest);
            }
        }

        let index = self.rng.random_range(0..self.weak_slots.len());
        let value = self.heap.weak_ref_read(self.weak_slots[index]);
        self.check_value(value)
    }

    fn weak_map(&self) -> Result<CellPtr, StressError> {
        match self.roots.get(0).as_cell() {
            Some(map) => Ok(map),
            None => err_corrupt(String::from("weak map root was cleared")),
        }
    }

    fn update_weak_map(&mut self) -> Result<(), StressError> {
        let key = self.random_value();
        if key.is_empty() {
            return Ok(());
        }
        let value = self.random_value();

        if !self.heap.weak_map_set(self.weak_map()?, key, value) {
            // full: start over with an empty map, rooting the entry while
            // allocating since a young collection may move it
            let base = self.roots.push(key);
            self.roots.push(value);
            let map = self.heap.alloc_weak_map(&mut self.roots, MAP_ENTRIES)?;
            self.roots.set(0, map.into());
            let (key, value) = (self.roots.get(base), self.roots.get(base + 1));
            self.roots.truncate(base);
            self.heap.weak_map_set(map, key, value);
            return self.check_entry(map, key);
        }

        self.check_entry(self.weak_map()?, key)
    }

    fn check_entry(&self, map: CellPtr, key: Value) -> Result<(), StressError> {
        match self.heap.weak_map_get(map, key) {
            Some(found) => self.check_value(found),
            None => err_corrupt(format!("weak map lost live key {:?}", key)),
        }
    }

    /// Every cell the workload can see must still look like something it
    /// wrote
    fn check_value(&self, value: Value) -> Result<(), StressError> {
        let cell = match value.as_cell() {
            Some(cell) => cell,
            None => return Ok(()),
        };

        match self.heap.kind(cell) {
            CellKind::Object => match self.heap.load(cell, 0) {
                Value::Int(id) if id >= 0 && id < self.next_id => Ok(()),
                other => err_corrupt(format!("object {:?} has id {:?}", cell, other)),
            },
            CellKind::Bytes => match self.heap.load_raw(cell, 0) {
                BYTES_MAGIC => Ok(()),
                other => err_corrupt(format!("bytes {:?} start with {:#x}", cell, other)),
            },
            CellKind::WeakMap => Ok(()),
            kind => err_corrupt(format!("root reached a {} cell at {:?}", kind.name(), cell)),
        }
    }

    fn verify(&self) -> Result<(), StressError> {
        for index in 0..self.roots.len() {
            self.check_value(self.roots.get(index))?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Report, StressError> {
        self.heap.collect(&mut self.roots);
        self.verify()?;

        let mut reachable = 0;
        self.heap.for_all_live_objects(|_| reachable += 1);
        log::info!("{} cells live after the final collection", reachable);

        for slot in self.weak_slots.drain(..) {
            self.roots.remove_weak(slot);
            self.heap.free_weak_slot(slot);
        }

        let stats = self.heap.stats();
        let info = self.heap.heap_info();
        let dead_symbols = self.roots.dead_symbols().len();
        let allocations = self.allocations;
        let finalized = Arc::clone(&self.finalized);

        // runs every outstanding finalizer
        drop(self);

        Ok(Report {
            stats,
            info,
            allocations,
            finalized: finalized.load(Ordering::Relaxed),
            dead_symbols,
        })
    }
}
