use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use fnv::FnvHashMap;
use parking_lot::MutexGuard;

use crate::cell::{CellKind, CellRef};
use crate::constants;
use crate::error::HeapError;
use crate::heap::Shared;
use crate::mark::MarkAcceptor;
use crate::phase::Phase;
use crate::rawptr::CellPtr;
use crate::roots::RootSet;
use crate::segment::{Generation, HeapSegment, SegmentMeta, SweepResult};
use crate::weakref::WeakUpdate;

/// The old generation: segments plus the bookkeeping of the cycle that
/// collects them. Everything in here is behind the old generation lock.
pub(crate) struct OldGen {
    pub segments: Vec<HeapSegment>,
    /// Background cycle, joined before the next one starts
    pub marker_thread: Option<JoinHandle<()>>,
    /// A cycle waiting to be run on the mutator, in incremental mode
    pub pending_cycle: Option<OldGenCycle>,
    /// Symbol liveness from the last cycle, not yet handed to the runtime
    pub symbol_liveness: Option<Vec<bool>>,
}

impl OldGen {
    pub fn new(segment_count: usize) -> Result<OldGen, HeapError> {
        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            segments.push(HeapSegment::new(Generation::Old)?);
        }

        Ok(OldGen {
            segments,
            marker_thread: None,
            pending_cycle: None,
            symbol_liveness: None,
        })
    }

    pub fn allocated_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.allocated_bytes()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.segments.len() * constants::SEGMENT_CAPACITY
    }

    pub fn occupancy(&self) -> f64 {
        self.allocated_bytes() as f64 / self.capacity() as f64
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.segments.iter().any(|s| s.contains(addr))
    }

    /// First fit across all segments. New cells are marked so a running
    /// marker treats them as live.
    fn search(&mut self, size: usize) -> Option<(CellPtr, usize)> {
        for segment in self.segments.iter_mut() {
            if let Some((cell, taken)) = segment.alloc(size) {
                segment.meta().mark(cell);
                return Some((cell, taken));
            }
        }
        None
    }
}

/// Allocate in the old generation: search, then grow, then wait for a
/// running collection and search once more. `None` means the old generation
/// is exhausted.
pub(crate) fn old_gen_alloc(
    shared: &Shared,
    old_gen: &mut MutexGuard<'_, OldGen>,
    size: usize,
) -> Option<(CellPtr, usize)> {
    if let Some(allocation) = old_gen.search(size) {
        return Some(allocation);
    }

    if old_gen.segments.len() < shared.config.max_old_segments() {
        match HeapSegment::new(Generation::Old) {
            Ok(mut segment) => {
                let allocation = segment.alloc(size);
                if let Some((cell, _)) = allocation {
                    segment.meta().mark(cell);
                }
                old_gen.segments.push(segment);
                return allocation;
            }
            Err(e) => log::warn!("could not grow the old generation: {:?}", e),
        }
    }

    wait_for_collection(shared, old_gen);
    old_gen.search(size)
}

/// Block until no old generation cycle is active. The caller must have
/// yielded to the background thread.
pub(crate) fn wait_for_collection(shared: &Shared, old_gen: &mut MutexGuard<'_, OldGen>) {
    if let Some(cycle) = old_gen.pending_cycle.take() {
        MutexGuard::unlocked(old_gen, || cycle.run(shared));
    }

    while shared.phase.load() != Phase::None {
        shared.collection_done.wait(old_gen);
    }

    if let Some(marker) = old_gen.marker_thread.take() {
        if marker.join().is_err() {
            panic!("old generation marker thread panicked");
        }
    }
}

/// Begin an old generation cycle: clear marks, mark roots and hand the rest
/// of the cycle to the marker thread (or park it for the mutator). Runs on
/// the mutator with the young generation empty.
pub(crate) fn start_old_gen_collection(
    shared: &Arc<Shared>,
    old_gen: &mut MutexGuard<'_, OldGen>,
    roots: &mut dyn RootSet,
) {
    debug_assert_eq!(shared.phase.load(), Phase::None);
    debug_assert_eq!(shared.young.used(), 0);

    if let Some(marker) = old_gen.marker_thread.take() {
        if marker.join().is_err() {
            panic!("old generation marker thread panicked");
        }
    }

    for segment in old_gen.segments.iter() {
        segment.meta().mark_bits.clear();
    }

    let mut marker = MarkAcceptor::new(shared.young.base(), roots.symbol_count());
    {
        let mut weak = shared.weak_refs.lock();
        marker.mark_roots(roots, &mut weak);
    }
    shared.phase.store(Phase::Mark);

    let cycle = OldGenCycle {
        marker,
        started: Instant::now(),
        bytes_before: old_gen.allocated_bytes(),
    };

    if shared.config.concurrent {
        let background = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(String::from("gc-marker"))
            .spawn(move || cycle.run(&background));
        match spawned {
            Ok(handle) => old_gen.marker_thread = Some(handle),
            Err(e) => panic!("could not spawn the marker thread: {}", e),
        }
    } else {
        old_gen.pending_cycle = Some(cycle);
    }
}

/// The part of an old generation cycle that runs after root marking
pub(crate) struct OldGenCycle {
    marker: MarkAcceptor,
    started: Instant,
    bytes_before: usize,
}

impl OldGenCycle {
    pub fn run(mut self, shared: &Shared) {
        self.marker.drain(shared);
        let weak = self.complete_marking(shared);
        self.sweep(shared, weak);
    }

    /// Finish marking with the mutator stopped: drain whatever the barriers
    /// pushed, resolve weak maps, account for the young generation's symbols
    /// and weak slots, then free unreferenced weak slots and clear the ones
    /// whose target died.
    fn complete_marking(&mut self, shared: &Shared) -> WeakUpdate {
        let world = shared.wait_for_world_stopped();
        let mut old_gen = shared.old_gen.lock();
        let mut weak = shared.weak_refs.lock();

        self.marker.drain_locked(&shared.worklist, &mut weak);

        shared.phase.store(Phase::WeakMapScan);
        self.marker.complete_weak_map_marking(&shared.worklist, &mut weak);
        self.marker.mark_young_gen_metadata(&shared.young, &mut weak);
        debug_assert!(shared.worklist.is_empty());

        let symbols = self.marker.take_symbols();
        if !symbols.is_empty() {
            old_gen.symbol_liveness = Some(symbols);
        }

        let update = weak.update_for_old_gen(|cell| {
            shared.in_young(cell.as_word()) || unsafe { SegmentMeta::of(cell.as_word()) }.is_marked(cell)
        });

        log::debug!(
            "marking complete: {} cells marked, {} weak slots cleared, {} freed",
            self.marker.marked_cells(),
            update.cleared,
            update.freed
        );

        shared.phase.store(Phase::Sweep);
        drop(weak);
        drop(old_gen);
        drop(world);
        update
    }

    /// Sweep one segment per acquisition of the old generation lock. The
    /// mutator may allocate in between; new cells are marked so they survive.
    fn sweep(&mut self, shared: &Shared, weak: WeakUpdate) {
        let mut total = SweepResult::default();
        let mut index = 0;

        loop {
            let mut old_gen = shared.old_gen.lock();

            if index < old_gen.segments.len() {
                let result = old_gen.segments[index].sweep(|cell| shared.finalize(cell));
                total.freed_bytes += result.freed_bytes;
                total.freed_cells += result.freed_cells;
                total.finalized += result.finalized;
                index += 1;
                continue;
            }

            let wall = self.started.elapsed();
            shared
                .stats
                .lock()
                .record_old(wall, total.freed_bytes, total.finalized, weak);
            log::info!(
                "old generation cycle: {} -> {} bytes, {} cells freed, {} finalized, in {:?}",
                self.bytes_before,
                old_gen.allocated_bytes(),
                total.freed_cells,
                total.finalized,
                wall
            );

            shared.phase.store(Phase::None);
            drop(old_gen);
            break;
        }

        shared.collection_done.notify_all();
    }
}

/// Run every outstanding finalizer exactly once: young finalizable cells that
/// were not evacuated and every finalizable cell in the old generation.
pub(crate) fn finalize_all(
    shared: &Shared,
    old_gen: &OldGen,
    young_finalizables: &[CellPtr],
    evacuated: Option<&FnvHashMap<CellPtr, CellPtr>>,
) {
    if shared.mark_finalized_all() {
        return;
    }

    let mut finalized = 0;
    for cell in young_finalizables {
        if evacuated.map_or(true, |forwarding| !forwarding.contains_key(cell)) {
            shared.finalize(CellRef::new(*cell));
            finalized += 1;
        }
    }
    for segment in old_gen.segments.iter() {
        segment.for_each_cell(|cell| {
            let header = cell.header();
            if header.kind() != CellKind::Freelist && header.has_finalizer() {
                shared.finalize(cell);
                finalized += 1;
            }
        });
    }
    log::debug!("finalized {} cells at heap teardown", finalized);
}

/// The old generation cannot satisfy an allocation even after collecting.
/// Finalize everything, report the heap, and stop.
pub(crate) fn fatal_out_of_memory(
    shared: &Shared,
    old_gen: &OldGen,
    young_finalizables: &[CellPtr],
    evacuated: Option<&FnvHashMap<CellPtr, CellPtr>>,
) -> ! {
    finalize_all(shared, old_gen, young_finalizables, evacuated);

    log::error!(
        "out of memory: {} of {} old generation bytes in {} segments, young {} bytes; {}",
        old_gen.allocated_bytes(),
        old_gen.capacity(),
        old_gen.segments.len(),
        shared.young.used(),
        *shared.stats.lock()
    );

    if shared.config.abort_on_oom {
        std::process::abort();
    }
    panic!("out of memory");
}
