use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::region::{Span, CACHE_LINE};

/// A freshly- or previously-allocated slot: the per-record header bytes and
/// the payload bytes right behind them.
#[derive(Clone, Copy, Debug)]
pub struct RawTuple {
    pub header: Span,
    pub data: Span,
}

/// Fixed-size slot allocator over a span of persistent memory.
///
/// Every slot is `header_size + data_size` bytes, rounded up to a cache line
/// so headers containing atomics stay aligned and flushes of neighbouring
/// slots do not interfere. Slots are handed out from a lock-free free list,
/// falling back to a fresh-slot watermark; both live in DRAM and are rebuilt
/// from the headers' valid bits after a crash.
pub struct Slab {
    span: Span,
    header_size: u32,
    data_size: u32,
    slot_size: usize,
    capacity: u32,
    free: ArrayQueue<u32>,
    fresh: AtomicU32,
}

impl Slab {
    pub fn slot_bytes(header_size: u32, data_size: u32) -> usize {
        let raw = header_size as usize + data_size as usize;
        raw.div_ceil(CACHE_LINE) * CACHE_LINE
    }

    /// Bytes of backing memory needed for `capacity` slots.
    pub fn required_bytes(header_size: u32, data_size: u32, capacity: u32) -> usize {
        Self::slot_bytes(header_size, data_size) * capacity as usize
    }

    pub fn new(span: Span, header_size: u32, data_size: u32, capacity: u32) -> Self {
        let slot_size = Self::slot_bytes(header_size, data_size);
        assert!(span.len() >= slot_size * capacity as usize);
        Self {
            span,
            header_size,
            data_size,
            slot_size,
            capacity,
            free: ArrayQueue::new(capacity as usize),
            fresh: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    pub fn get(&self, idx: u32) -> RawTuple {
        assert!(idx < self.capacity);
        let slot = self.span.slice(idx as usize * self.slot_size, self.slot_size);
        let (header, rest) = slot.split_at(self.header_size as usize);
        RawTuple {
            header,
            data: rest.slice(0, self.data_size as usize),
        }
    }

    /// Allocate one slot, or `None` when the slab is full.
    pub fn alloc(&self) -> Option<RawTuple> {
        if let Some(idx) = self.free.pop() {
            return Some(self.get(idx));
        }
        let idx = self
            .fresh
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| (n < self.capacity).then(|| n + 1))
            .ok()?;
        Some(self.get(idx))
    }

    /// Return a slot to the free list. The caller must already have cleared
    /// the header's valid bit and flushed it.
    pub fn free(&self, tuple: RawTuple) {
        let idx = self.index_of(&tuple);
        // Capacity equals slot count, so push cannot fail for a slot that was
        // handed out exactly once.
        let _ = self.free.push(idx);
    }

    pub fn index_of(&self, tuple: &RawTuple) -> u32 {
        let off = self.span.offset_of(&tuple.header);
        debug_assert_eq!(off % self.slot_size, 0);
        (off / self.slot_size) as u32
    }

    /// Visit every slot. Recovery uses this to find live headers; the
    /// callback decides liveness by looking at the header bytes.
    pub fn scan(&self, mut f: impl FnMut(u32, RawTuple)) {
        for idx in 0..self.capacity {
            f(idx, self.get(idx));
        }
    }

    /// Reset the allocation state after a crash: slots for which `live`
    /// returns false go back on the free list.
    pub fn rebuild(&self, live: impl Fn(u32) -> bool) {
        self.fresh.store(self.capacity, Ordering::Relaxed);
        for idx in 0..self.capacity {
            if !live(idx) {
                let _ = self.free.push(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;

    fn slab(capacity: u32) -> (Region, u32, u32) {
        let header = 16;
        let data = 100;
        let region = Region::anonymous(Slab::required_bytes(header, data, capacity)).unwrap();
        (region, header, data)
    }

    #[test]
    fn alloc_until_exhausted_then_reuse() {
        let (region, header, data) = slab(4);
        let slab = Slab::new(region.span(), header, data, 4);

        let tuples: Vec<_> = (0..4).map(|_| slab.alloc().unwrap()).collect();
        assert!(slab.alloc().is_none());

        slab.free(tuples[2]);
        let again = slab.alloc().unwrap();
        assert_eq!(slab.index_of(&again), 2);
    }

    #[test]
    fn slots_are_cache_line_sized() {
        let (region, header, data) = slab(2);
        let slab = Slab::new(region.span(), header, data, 2);
        let a = slab.get(0);
        let b = slab.get(1);
        assert_eq!(region.span().offset_of(&b.header) - region.span().offset_of(&a.header), 128);
        assert_eq!(a.data.len(), 100);
    }

    #[test]
    fn rebuild_reclaims_dead_slots() {
        let (region, header, data) = slab(8);
        let slab = Slab::new(region.span(), header, data, 8);
        for _ in 0..8 {
            slab.alloc().unwrap();
        }
        assert!(slab.alloc().is_none());

        // Pretend only even slots survived the crash.
        slab.rebuild(|idx| idx % 2 == 0);
        for _ in 0..4 {
            assert!(slab.alloc().is_some());
        }
        assert!(slab.alloc().is_none());
    }
}
