use std::{
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

use pmtx_pmem::{RawTuple, Span, TableId};

use crate::latch::RwLatch;

/// DRAM-resident mirror of a tuple's header: the latch, the write timestamp
/// and the *visible* payload pointer transactions read and write through.
///
/// The primary index points here, never at NVM; the visible pointer equals
/// the NVM payload until Courier-Save links a cache tuple in front of it.
pub struct VirtualHeader {
    latch: RwLatch,
    wts: AtomicU64,
    visible: AtomicPtr<u8>,
    /// Opaque handle to the cache slot backing `visible`, zero when the
    /// visible pointer is the NVM payload. Interpreted by the cache ring;
    /// read and written only under the write latch or the dissolve protocol.
    cache_token: AtomicUsize,
    origin: Span,
    table: TableId,
}

impl VirtualHeader {
    /// Allocate a header for a live record. There is exactly one per record;
    /// the returned handle is what index entries carry.
    pub fn alloc(wts: u64, origin: Span, table: TableId) -> VhRef {
        let boxed = Box::new(VirtualHeader {
            latch: RwLatch::new(),
            wts: AtomicU64::new(wts),
            visible: AtomicPtr::new(origin.as_ptr()),
            cache_token: AtomicUsize::new(0),
            origin,
            table,
        });
        VhRef(NonNull::from(Box::leak(boxed)))
    }

    pub fn latch(&self) -> &RwLatch {
        &self.latch
    }

    pub fn wts(&self) -> u64 {
        self.wts.load(Ordering::Acquire)
    }

    /// Advance the write timestamp by one. Caller holds the write latch, so
    /// the plain load is race-free.
    pub fn bump_wts(&self) {
        let cur = self.wts.load(Ordering::Relaxed);
        self.wts.store(cur + 1, Ordering::Release);
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn origin(&self) -> Span {
        self.origin
    }

    pub fn visible_ptr(&self) -> *mut u8 {
        self.visible.load(Ordering::Acquire)
    }

    fn visible_span(&self) -> Span {
        // SAFETY: the visible pointer is either the origin payload or a live
        // cache slot, both covering `origin.len()` bytes.
        unsafe { Span::from_raw(self.visible_ptr(), self.origin.len()) }
    }

    /// Point the visible address at a cache slot.
    pub fn redirect(&self, ptr: *mut u8) {
        self.visible.store(ptr, Ordering::Release);
    }

    /// Point the visible address back at the NVM payload.
    pub fn reset_visible(&self) {
        self.visible.store(self.origin.as_ptr(), Ordering::Release);
    }

    pub fn cache_token(&self) -> usize {
        self.cache_token.load(Ordering::Acquire)
    }

    pub fn set_cache_token(&self, token: usize) {
        self.cache_token.store(token, Ordering::Release);
    }

    pub fn read_visible(&self, offset: u32, dst: &mut [u8]) {
        self.visible_span().read_into(offset as usize, dst);
    }

    pub fn write_visible(&self, offset: u32, src: &[u8]) {
        self.visible_span().write_from(offset as usize, src);
    }
}

/// Copyable handle to a [`VirtualHeader`].
///
/// Headers are freed only through the engine's deferred reclamation (index
/// teardown or the delete graveyard at engine drop), so a handle obtained
/// from a live index entry stays dereferenceable for the engine's lifetime.
#[derive(Clone, Copy, Debug)]
pub struct VhRef(NonNull<VirtualHeader>);

// SAFETY: the pointee is all atomics/latches and immutable spans; see the
// liveness argument on the type.
unsafe impl Send for VhRef {}
unsafe impl Sync for VhRef {}

impl VhRef {
    /// Stable identity of the underlying header, used as dedup-map key.
    pub fn ident(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Free the header.
    ///
    /// # Safety
    ///
    /// No other handle to this header may be dereferenced afterwards; called
    /// only from teardown paths that own the last references.
    pub unsafe fn release(self) {
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

impl Deref for VhRef {
    type Target = VirtualHeader;

    fn deref(&self) -> &VirtualHeader {
        // SAFETY: see the liveness argument on the type.
        unsafe { self.0.as_ref() }
    }
}

/// Index entry of the Courier family: the slot spans for teardown plus the
/// virtual header all reads and writes go through.
#[derive(Clone, Copy, Debug)]
pub struct CourierRef {
    pub table: TableId,
    pub size: u32,
    pub raw: RawTuple,
    pub vh: VhRef,
}

impl CourierRef {
    pub(crate) fn prefix(&self) -> &crate::tuple::HeaderPrefix {
        crate::tuple::HeaderPrefix::at(&self.raw.header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmtx_pmem::Region;

    #[test]
    fn visible_pointer_redirects_and_resets() {
        let region = Region::anonymous(4096).unwrap();
        let origin = region.span().slice(0, 64);
        let side = region.span().slice(1024, 64);

        let vh = VirtualHeader::alloc(0, origin, TableId(0));
        assert_eq!(vh.visible_ptr(), origin.as_ptr());

        vh.write_visible(8, &[3u8; 4]);
        let mut buf = [0u8; 4];
        origin.read_into(8, &mut buf);
        assert_eq!(buf, [3u8; 4]);

        vh.redirect(side.as_ptr());
        vh.write_visible(0, &[9u8; 4]);
        side.read_into(0, &mut buf);
        assert_eq!(buf, [9u8; 4]);
        origin.read_into(0, &mut buf);
        assert_ne!(buf, [9u8; 4]);

        vh.reset_visible();
        assert_eq!(vh.visible_ptr(), origin.as_ptr());

        assert_eq!(vh.wts(), 0);
        vh.bump_wts();
        assert_eq!(vh.wts(), 1);

        unsafe { vh.release() };
    }
}
