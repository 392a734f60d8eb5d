use std::{
    hint,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use pmtx_pmem::{Span, TableId, TableSchema};

use crate::courier::vheader::{VhRef, VirtualHeader};

/// Reference-count value marking a slot as being dissolved.
const EXCLUSIVE: u32 = u32::MAX;

struct SlotMeta {
    /// Live references from in-flight commits; `EXCLUSIVE` while a persist
    /// worker dissolves the link.
    refs: AtomicU32,
    /// Back pointer to the linked virtual header; null means the slot is
    /// free for reuse.
    vh: AtomicPtr<VirtualHeader>,
}

struct TableCache {
    metas: Box<[SlotMeta]>,
    arena: Box<[u8]>,
    stride: usize,
    /// Ring allocation cursor, advanced by the owning worker.
    cursor: AtomicUsize,
}

/// Per-worker ring of DRAM cache tuples, one sub-ring per table.
///
/// Allocation is a single probe: if the slot under the cursor is still
/// linked, the caller gets nothing and the commit writes through to NVM
/// instead. Slots return to the ring when a persist worker dissolves their
/// link after flushing the contents.
pub struct CacheRing {
    tables: Vec<TableCache>,
}

impl CacheRing {
    pub fn new(schemas: &[TableSchema], bytes_per_table: usize) -> Self {
        let tables = schemas
            .iter()
            .map(|schema| {
                let stride = (schema.tuple_size as usize).next_multiple_of(16);
                let slots = (bytes_per_table / stride).max(1);
                TableCache {
                    metas: (0..slots)
                        .map(|_| SlotMeta {
                            refs: AtomicU32::new(0),
                            vh: AtomicPtr::new(std::ptr::null_mut()),
                        })
                        .collect(),
                    arena: vec![0u8; slots * stride].into_boxed_slice(),
                    stride,
                    cursor: AtomicUsize::new(0),
                }
            })
            .collect();
        Self { tables }
    }

    /// Probe the ring for a free slot. Returns the slot's data span and the
    /// not-yet-linked slot handle; the caller fills the data and then calls
    /// [`CacheSlot::link`].
    pub fn try_alloc(&self, table: TableId) -> Option<(Span, CacheSlot)> {
        let cache = &self.tables[table.idx()];
        let cur = cache.cursor.load(Ordering::Relaxed);
        let idx = cur % cache.metas.len();
        cache.cursor.store(cur + 1, Ordering::Relaxed);

        let meta = &cache.metas[idx];
        if !meta.vh.load(Ordering::Acquire).is_null() {
            return None;
        }
        // SAFETY: the arena is owned by this ring; stride-sized window.
        let data = unsafe { Span::from_raw(cache.arena.as_ptr().add(idx * cache.stride) as *mut u8, cache.stride) };
        Some((
            data,
            CacheSlot {
                meta: NonNull::from(meta),
            },
        ))
    }
}

/// Handle to one cache slot's metadata. The raw-address form round-trips
/// through [`VirtualHeader::cache_token`].
#[derive(Clone, Copy, Debug)]
pub struct CacheSlot {
    meta: NonNull<SlotMeta>,
}

// SAFETY: the pointee is all atomics; cache rings outlive the engine's
// workers and pipeline, which are the only holders of slot handles.
unsafe impl Send for CacheSlot {}
unsafe impl Sync for CacheSlot {}

impl CacheSlot {
    pub fn token(self) -> usize {
        self.meta.as_ptr() as usize
    }

    /// Rebuild a handle from a token stored in a virtual header.
    ///
    /// # Safety
    ///
    /// `token` must come from [`CacheSlot::token`] of a ring that is still
    /// alive.
    pub unsafe fn from_token(token: usize) -> CacheSlot {
        CacheSlot {
            meta: NonNull::new(token as *mut SlotMeta).expect("zero cache token"),
        }
    }

    fn meta(&self) -> &SlotMeta {
        // SAFETY: see type-level liveness note.
        unsafe { self.meta.as_ref() }
    }

    /// Take a shared reference, waiting out a concurrent dissolve attempt
    /// (which fails fast when it cannot latch the header).
    fn add_ref(&self) {
        let refs = &self.meta().refs;
        loop {
            let cur = refs.load(Ordering::Acquire);
            if cur == EXCLUSIVE {
                hint::spin_loop();
                continue;
            }
            if refs
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Link the slot in front of `vh` and take the first shared reference.
    /// Runs under the virtual header's write latch.
    pub fn link(self, vh: VhRef, data: Span) -> CacheGuard {
        self.meta().vh.store(vh.ident() as *mut VirtualHeader, Ordering::Release);
        vh.set_cache_token(self.token());
        vh.redirect(data.as_ptr());
        self.add_ref();
        CacheGuard { slot: self }
    }

    /// Take a shared reference on an already-linked slot (subsequent update
    /// of a cached record). Runs under the virtual header's write latch.
    pub fn acquire(self) -> CacheGuard {
        self.add_ref();
        CacheGuard { slot: self }
    }

    /// After the NVM copy: if no commit still references the slot and the
    /// header is quiescent, point the header back at NVM and free the slot.
    pub fn try_dissolve(self, vh: VhRef) {
        let meta = self.meta();
        if meta
            .refs
            .compare_exchange(0, EXCLUSIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // A committer writing this record right now is also using the cache
        // slot; leave the link alone in that case.
        if vh.latch().try_write() {
            vh.reset_visible();
            vh.set_cache_token(0);
            vh.latch().unlock_write();
            meta.refs.store(0, Ordering::Release);
            // Publish reusability last: an allocator that sees the null back
            // pointer must also see the cleared reference count.
            meta.vh.store(std::ptr::null_mut(), Ordering::Release);
        } else {
            meta.refs.store(0, Ordering::Release);
        }
    }
}

/// One shared reference to a linked cache slot, held from the commit apply
/// phase until the deferred persist worker has copied the slot to NVM.
#[derive(Debug)]
pub struct CacheGuard {
    slot: CacheSlot,
}

impl CacheGuard {
    /// Release the reference and hand back the slot for a dissolve attempt.
    pub fn release(self) -> CacheSlot {
        let slot = self.slot;
        slot.meta().refs.fetch_sub(1, Ordering::AcqRel);
        std::mem::forget(self);
        slot
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        self.slot.meta().refs.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmtx_pmem::Region;

    fn schema() -> [TableSchema; 1] {
        [TableSchema {
            tuple_size: 48,
            max_tuples: 8,
        }]
    }

    #[test]
    fn link_redirects_and_dissolve_restores() {
        let region = Region::anonymous(4096).unwrap();
        let origin = region.span().slice(0, 48);
        let vh = VirtualHeader::alloc(0, origin, TableId(0));

        let ring = CacheRing::new(&schema(), 1 << 12);
        let (data, slot) = ring.try_alloc(TableId(0)).unwrap();
        let guard = slot.link(vh, data);
        assert_eq!(vh.visible_ptr(), data.as_ptr());
        assert_eq!(vh.cache_token(), slot.token());

        // While referenced, dissolve must not unlink.
        slot.try_dissolve(vh);
        assert_eq!(vh.visible_ptr(), data.as_ptr());

        let slot = guard.release();
        slot.try_dissolve(vh);
        assert_eq!(vh.visible_ptr(), origin.as_ptr());
        assert_eq!(vh.cache_token(), 0);

        // The slot is reusable afterwards.
        let mut found = false;
        for _ in 0..ring.tables[0].metas.len() {
            if let Some((d, _)) = ring.try_alloc(TableId(0)) {
                if d.as_ptr() == data.as_ptr() {
                    found = true;
                    break;
                }
            }
        }
        assert!(found);

        unsafe { vh.release() };
    }

    #[test]
    fn dissolve_defers_to_latched_header() {
        let region = Region::anonymous(4096).unwrap();
        let origin = region.span().slice(0, 48);
        let vh = VirtualHeader::alloc(0, origin, TableId(0));

        let ring = CacheRing::new(&schema(), 1 << 12);
        let (data, slot) = ring.try_alloc(TableId(0)).unwrap();
        let guard = slot.link(vh, data);

        // A committer holds the write latch: releasing the last reference
        // must leave the link in place.
        vh.latch().write();
        let slot = guard.release();
        slot.try_dissolve(vh);
        assert_eq!(vh.visible_ptr(), data.as_ptr());
        vh.latch().unlock_write();

        slot.try_dissolve(vh);
        assert_eq!(vh.visible_ptr(), origin.as_ptr());

        unsafe { vh.release() };
    }

    #[test]
    fn token_roundtrip_reacquires_slot() {
        let region = Region::anonymous(4096).unwrap();
        let origin = region.span().slice(0, 48);
        let vh = VirtualHeader::alloc(0, origin, TableId(0));

        let ring = CacheRing::new(&schema(), 1 << 12);
        let (data, slot) = ring.try_alloc(TableId(0)).unwrap();
        let first = slot.link(vh, data);

        let again = unsafe { CacheSlot::from_token(vh.cache_token()) };
        let second = again.acquire();

        // Two outstanding references: two releases needed before dissolve.
        let s1 = first.release();
        s1.try_dissolve(vh);
        assert_eq!(vh.visible_ptr(), data.as_ptr());
        let s2 = second.release();
        s2.try_dissolve(vh);
        assert_eq!(vh.visible_ptr(), origin.as_ptr());

        unsafe { vh.release() };
    }
}
