//! Page slot allocation for the bucket region
//!
//! One bit per 4KB page slot: 0 = free, 1 = used. The bitmap lives in memory
//! only and is rebuilt from the bucket region scan on open.

/// Bitmap allocator over page slots
#[derive(Debug)]
pub struct SlotBitmap {
    words: Vec<u64>,
    total: u64,
    free: u64,
    /// Next slot to start searching from
    hint: u64,
}

impl SlotBitmap {
    /// Create a bitmap with every slot free
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            words: vec![0; total.div_ceil(64) as usize],
            total,
            free: total,
            hint: 0,
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub const fn free_count(&self) -> u64 {
        self.free
    }

    #[must_use]
    pub fn is_used(&self, slot: u64) -> bool {
        slot >= self.total || self.words[(slot / 64) as usize] & (1 << (slot % 64)) != 0
    }

    /// Mark a slot used; returns false if it already was
    pub fn mark_used(&mut self, slot: u64) -> bool {
        if self.is_used(slot) {
            return false;
        }
        self.words[(slot / 64) as usize] |= 1 << (slot % 64);
        self.free -= 1;
        true
    }

    /// Release a slot; returns false if it was not in use
    pub fn free(&mut self, slot: u64) -> bool {
        if slot >= self.total || !self.is_used(slot) {
            return false;
        }
        self.words[(slot / 64) as usize] &= !(1 << (slot % 64));
        self.free += 1;
        true
    }

    /// Allocate one slot, searching from the hint and wrapping around
    pub fn allocate(&mut self) -> Option<u64> {
        if self.free == 0 {
            return None;
        }
        let slot = self
            .find_free(self.hint, self.total)
            .or_else(|| self.find_free(0, self.hint))?;
        self.mark_used(slot);
        self.hint = slot + 1;
        Some(slot)
    }

    /// Allocate `count` slots, all or nothing
    pub fn allocate_many(&mut self, count: usize) -> Option<Vec<u64>> {
        if (count as u64) > self.free {
            return None;
        }
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate() {
                Some(slot) => slots.push(slot),
                None => {
                    for slot in slots {
                        self.free(slot);
                    }
                    return None;
                }
            }
        }
        Some(slots)
    }

    fn find_free(&self, from: u64, to: u64) -> Option<u64> {
        let mut slot = from;
        while slot < to {
            let word = self.words[(slot / 64) as usize];
            if word == u64::MAX {
                slot = (slot / 64 + 1) * 64;
                continue;
            }
            if word & (1 << (slot % 64)) == 0 {
                return Some(slot);
            }
            slot += 1;
        }
        None
    }
}
