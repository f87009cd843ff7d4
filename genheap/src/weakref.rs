use crate::rawptr::CellPtr;
use crate::value::Value;

/// Index of a slot in the weak reference table
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeakSlotId(u32);

impl WeakSlotId {
    pub(crate) fn from_index(index: usize) -> WeakSlotId {
        WeakSlotId(index as u32)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WeakSlotState {
    Free,
    Unmarked,
    Marked,
}

#[derive(Debug)]
struct WeakRefSlot {
    state: WeakSlotState,
    value: Value,
}

/// What the end of an old generation cycle did to the table
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(crate) struct WeakUpdate {
    /// Kept slots whose target died
    pub cleared: usize,
    /// Slots neither the runtime nor a live cell referenced
    pub freed: usize,
}

/// Slots that observe a value without keeping it alive. The table lives
/// outside the heap and is guarded by its own lock, taken after the old
/// generation lock.
#[derive(Debug, Default)]
pub(crate) struct WeakRefTable {
    slots: Vec<WeakRefSlot>,
    free: Vec<usize>,
}

impl WeakRefTable {
    pub fn new() -> WeakRefTable {
        WeakRefTable::default()
    }

    /// Take a slot, reusing freed ones first. Slots created while marking are
    /// born marked since the marker will not come back for them.
    pub fn alloc(&mut self, value: Value, premark: bool) -> WeakSlotId {
        let state = if premark {
            WeakSlotState::Marked
        } else {
            WeakSlotState::Unmarked
        };
        let slot = WeakRefSlot { state, value };

        match self.free.pop() {
            Some(index) => {
                self.slots[index] = slot;
                WeakSlotId::from_index(index)
            }
            None => {
                self.slots.push(slot);
                WeakSlotId::from_index(self.slots.len() - 1)
            }
        }
    }

    pub fn free(&mut self, id: WeakSlotId) {
        let slot = self.live_slot_mut(id);
        slot.state = WeakSlotState::Free;
        slot.value = Value::Empty;
        self.free.push(id.index());
    }

    pub fn get(&self, id: WeakSlotId) -> Value {
        match self.slots.get(id.index()) {
            Some(slot) if slot.state != WeakSlotState::Free => slot.value,
            _ => panic!("read of free weak slot {}", id.index()),
        }
    }

    pub fn state(&self, id: WeakSlotId) -> WeakSlotState {
        self.slots
            .get(id.index())
            .map(|slot| slot.state)
            .unwrap_or(WeakSlotState::Free)
    }

    /// Freed slots stay free: dead young weak refs are walked too and may
    /// name a slot the program already released
    pub fn mark(&mut self, id: WeakSlotId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            if slot.state != WeakSlotState::Free {
                slot.state = WeakSlotState::Marked;
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// After a young collection: forward slots whose target was evacuated and
    /// clear the ones whose target died. Old generation liveness is not known
    /// here, so marks are only reset when no old generation cycle is running.
    pub fn update_for_young_gen<Y, F>(&mut self, in_young: Y, forwarded: F, old_gen_active: bool)
    where
        Y: Fn(CellPtr) -> bool,
        F: Fn(CellPtr) -> Option<CellPtr>,
    {
        for slot in self.slots.iter_mut() {
            if slot.state == WeakSlotState::Free {
                continue;
            }
            if !old_gen_active {
                slot.state = WeakSlotState::Unmarked;
            }
            if let Some(cell) = slot.value.as_cell() {
                if in_young(cell) {
                    slot.value = match forwarded(cell) {
                        Some(new) => Value::Cell(new),
                        None => Value::Empty,
                    };
                }
            }
        }
    }

    /// At the end of old generation marking: free every slot nothing marked,
    /// clear marked slots whose target was not proven live and reset marks
    /// for the next cycle.
    pub fn update_for_old_gen<L>(&mut self, is_live: L) -> WeakUpdate
    where
        L: Fn(CellPtr) -> bool,
    {
        let mut update = WeakUpdate::default();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot.state {
                WeakSlotState::Free => continue,
                WeakSlotState::Unmarked => {
                    slot.state = WeakSlotState::Free;
                    slot.value = Value::Empty;
                    self.free.push(index);
                    update.freed += 1;
                    continue;
                }
                WeakSlotState::Marked => slot.state = WeakSlotState::Unmarked,
            }
            if let Some(cell) = slot.value.as_cell() {
                if !is_live(cell) {
                    slot.value = Value::Empty;
                    update.cleared += 1;
                }
            }
        }
        update
    }

    fn live_slot_mut(&mut self, id: WeakSlotId) -> &mut WeakRefSlot {
        match self.slots.get_mut(id.index()) {
            Some(slot) if slot.state != WeakSlotState::Free => slot,
            _ => panic!("weak slot {} freed twice", id.index()),
        }
    }
}
