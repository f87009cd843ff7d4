use std::sync::atomic::{AtomicU8, Ordering};

/// Where the old generation cycle is. Barriers read this to pick their slow
/// paths.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    None = 0,
    Mark = 1,
    WeakMapScan = 2,
    Sweep = 3,
}

pub(crate) struct AtomicPhase(AtomicU8);

impl AtomicPhase {
    pub fn new() -> AtomicPhase {
        AtomicPhase(AtomicU8::new(Phase::None as u8))
    }

    pub fn load(&self) -> Phase {
        match self.0.load(Ordering::Acquire) {
            0 => Phase::None,
            1 => Phase::Mark,
            2 => Phase::WeakMapScan,
            _ => Phase::Sweep,
        }
    }

    /// Phase changes happen with the old generation lock held
    pub fn store(&self, phase: Phase) {
        log::debug!("old generation phase {:?}", phase);
        self.0.store(phase as u8, Ordering::Release);
    }
}
