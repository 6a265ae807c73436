//! # wheel
//!
//! why: O(1) placement and expiry of delayed tasks, independent of wall-clock time
//! relations: owned and advanced by the driver thread in driver.rs
//! what: Wheel with 2^bits slots, each entry tagged with the round it becomes due in

use std::mem;
use std::sync::Arc;

use crate::task::Task;

struct Slotted {
    round: u64,
    task: Arc<Task>,
}

/// Slot array plus an absolute cursor.
///
/// The cursor counts every advance since creation. Its low `bits` bits
/// select the slot, the remaining high bits are the current round (loop).
pub(crate) struct Wheel {
    slots: Vec<Vec<Slotted>>,
    bits: u32,
    mask: u64,
    cursor: u64,
}

impl Wheel {
    pub(crate) fn new(bits: u32) -> Self {
        let size = 1usize << bits;
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, Vec::new);
        Self {
            slots,
            bits,
            mask: (size as u64) - 1,
            cursor: 0,
        }
    }

    /// Number of advances performed so far.
    pub(crate) fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Place `task` so it becomes due `ticks` advances from now.
    fn place(&mut self, task: Arc<Task>, ticks: u64) {
        let mut round = (self.cursor >> self.bits) + (ticks >> self.bits);
        let mut slot = (self.cursor & self.mask) + (ticks & self.mask);
        if slot > self.mask {
            slot -= self.mask + 1;
            round += 1;
        }
        self.slots[slot as usize].push(Slotted { round, task });
    }

    /// Move one slot forward.
    ///
    /// Tasks scheduled since the previous advance are slotted relative to
    /// the new cursor first, then every task of the current slot whose
    /// round has been reached is returned. Repeating tasks are re-slotted
    /// at their period before being returned; cancelled tasks are dropped.
    pub(crate) fn advance<I>(&mut self, pending: I) -> Vec<Arc<Task>>
    where
        I: IntoIterator<Item = Arc<Task>>,
    {
        self.cursor += 1;
        for task in pending {
            if !task.is_cancelled() {
                let ticks = task.ticks;
                self.place(task, ticks);
            }
        }

        let round = self.cursor >> self.bits;
        let index = (self.cursor & self.mask) as usize;
        let current = mem::take(&mut self.slots[index]);
        let mut due = Vec::new();

        for entry in current {
            if entry.task.is_cancelled() {
                continue;
            }
            if entry.round > round {
                self.slots[index].push(entry);
                continue;
            }
            if entry.task.repeat {
                let period = entry.task.ticks.max(1);
                due.push(entry.task.clone());
                self.place(entry.task, period);
            } else if entry.task.try_fire() {
                due.push(entry.task);
            }
        }
        due
    }
}
