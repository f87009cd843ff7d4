use crate::constants;
use crate::error::{err_config, HeapError};

/// Tunables for a `Heap`
#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Upper bound on heap memory, the young segment included
    pub max_heap_size: usize,
    /// Old generation memory reserved up front
    pub init_heap_size: usize,
    /// Cells at least this big are allocated straight into the old generation
    pub large_object_threshold: usize,
    /// Old generation occupancy after a young collection that starts an old
    /// generation cycle
    pub occupancy_target: f64,
    /// Run old generation cycles on a background thread. When false the
    /// pending cycle runs on the mutator whenever it has to wait for it.
    pub concurrent: bool,
    /// Abort the process on fatal out-of-memory instead of panicking
    pub abort_on_oom: bool,
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig {
            max_heap_size: constants::DEFAULT_MAX_HEAP_SIZE,
            init_heap_size: constants::SEGMENT_SIZE,
            large_object_threshold: constants::DEFAULT_LARGE_OBJECT_THRESHOLD,
            occupancy_target: constants::DEFAULT_OCCUPANCY_TARGET,
            concurrent: true,
            abort_on_oom: true,
        }
    }
}

impl GcConfig {
    pub fn with_max_heap_size(mut self, bytes: usize) -> GcConfig {
        self.max_heap_size = bytes;
        self
    }

    pub fn with_init_heap_size(mut self, bytes: usize) -> GcConfig {
        self.init_heap_size = bytes;
        self
    }

    pub fn with_large_object_threshold(mut self, bytes: usize) -> GcConfig {
        self.large_object_threshold = bytes;
        self
    }

    pub fn with_occupancy_target(mut self, fraction: f64) -> GcConfig {
        self.occupancy_target = fraction;
        self
    }

    pub fn with_concurrent(mut self, concurrent: bool) -> GcConfig {
        self.concurrent = concurrent;
        self
    }

    pub fn with_abort_on_oom(mut self, abort: bool) -> GcConfig {
        self.abort_on_oom = abort;
        self
    }

    pub fn validate(&self) -> Result<(), HeapError> {
        if self.max_heap_size < 2 * constants::SEGMENT_SIZE {
            return err_config("max heap size must fit a young and an old segment");
        }
        if self.init_heap_size > self.max_heap_size - constants::SEGMENT_SIZE {
            return err_config("initial heap size exceeds the maximum");
        }
        if self.large_object_threshold < constants::MIN_CELL_SIZE
            || self.large_object_threshold > constants::SEGMENT_CAPACITY
        {
            return err_config("large object threshold must lie within a segment");
        }
        if !(self.occupancy_target > 0.0 && self.occupancy_target <= 1.0) {
            return err_config("occupancy target must be in (0, 1]");
        }
        Ok(())
    }

    /// Old generation segments the heap may grow to
    pub fn max_old_segments(&self) -> usize {
        self.max_heap_size / constants::SEGMENT_SIZE - 1
    }

    /// Old generation segments created by `Heap::new`
    pub fn init_old_segments(&self) -> usize {
        let segments = (self.init_heap_size + constants::SEGMENT_SIZE - 1) / constants::SEGMENT_SIZE;
        segments.clamp(1, self.max_old_segments())
    }
}
