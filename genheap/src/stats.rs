use std::fmt;
use std::time::{Duration, Instant};

use crate::weakref::WeakUpdate;

/// Cumulative collector statistics
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GcStats {
    pub young_collections: u64,
    pub old_collections: u64,
    pub young_pause_total: Duration,
    pub young_pause_max: Duration,
    pub old_cycle_total: Duration,
    pub bytes_evacuated: u64,
    pub bytes_swept: u64,
    pub cells_finalized: u64,
    pub weak_slots_cleared: u64,
    pub weak_slots_freed: u64,
}

impl GcStats {
    pub(crate) fn record_young(&mut self, pause: Duration, evacuated: usize, finalized: usize) {
        self.young_collections += 1;
        self.young_pause_total += pause;
        self.young_pause_max = self.young_pause_max.max(pause);
        self.bytes_evacuated += evacuated as u64;
        self.cells_finalized += finalized as u64;
    }

    pub(crate) fn record_old(&mut self, wall: Duration, swept: usize, finalized: usize, weak: WeakUpdate) {
        self.old_collections += 1;
        self.old_cycle_total += wall;
        self.bytes_swept += swept as u64;
        self.cells_finalized += finalized as u64;
        self.weak_slots_cleared += weak.cleared as u64;
        self.weak_slots_freed += weak.freed as u64;
    }
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "young: {} collections, {:?} total pause, {:?} max pause, {} bytes evacuated; \
             old: {} cycles, {:?} total, {} bytes swept; {} finalized, {} weak slots cleared, {} freed",
            self.young_collections,
            self.young_pause_total,
            self.young_pause_max,
            self.bytes_evacuated,
            self.old_collections,
            self.old_cycle_total,
            self.bytes_swept,
            self.cells_finalized,
            self.weak_slots_cleared,
            self.weak_slots_freed
        )
    }
}

/// A point-in-time view of heap occupancy
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeapInfo {
    pub allocated_bytes: usize,
    pub heap_size: usize,
    pub young_used: usize,
    pub old_gen_allocated: usize,
    pub old_gen_segments: usize,
    pub weak_slots_in_use: usize,
}

impl fmt::Display for HeapInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} of {} bytes allocated (young {}, old {} in {} segments), {} weak slots",
            self.allocated_bytes,
            self.heap_size,
            self.young_used,
            self.old_gen_allocated,
            self.old_gen_segments,
            self.weak_slots_in_use
        )
    }
}

/// Times one collection and logs it when done
pub(crate) struct CollectionSection {
    name: &'static str,
    started: Instant,
    bytes_before: usize,
}

impl CollectionSection {
    pub fn new(name: &'static str, bytes_before: usize) -> CollectionSection {
        log::debug!("{} collection starting with {} bytes", name, bytes_before);
        CollectionSection {
            name,
            started: Instant::now(),
            bytes_before,
        }
    }

    pub fn finish(self, bytes_after: usize) -> Duration {
        let elapsed = self.started.elapsed();
        log::debug!(
            "{} collection: {} -> {} bytes in {:?}",
            self.name,
            self.bytes_before,
            bytes_after,
            elapsed
        );
        elapsed
    }
}
