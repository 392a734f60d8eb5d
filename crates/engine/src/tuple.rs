use std::sync::atomic::{AtomicU8, Ordering};

use pmtx_pmem::{Key, RawTuple, Span, TableId};

/// Common prefix of every engine's NVM tuple header: the valid bit recovery
/// uses to skip freed slots, and the key identifying the record.
///
/// Engine headers embed this as their first field; the remaining fields
/// (timestamps, latch, version ring) vary per engine.
#[repr(C)]
pub struct HeaderPrefix {
    valid: AtomicU8,
    _pad: [u8; 3],
    table: u32,
    row: u64,
}

impl HeaderPrefix {
    pub const SIZE: usize = std::mem::size_of::<HeaderPrefix>();

    /// Overlay a prefix on the header bytes of a slot.
    pub fn at(span: &Span) -> &HeaderPrefix {
        assert!(span.len() >= Self::SIZE);
        // SAFETY: span points into the slab, is cache-line aligned (so at
        // least 8-byte aligned) and long enough; all mutation of the prefix
        // goes through this overlay.
        unsafe { &*(span.as_ptr() as *const HeaderPrefix) }
    }

    /// Initialize the key fields and publish the valid bit last.
    pub fn init(span: &Span, key: Key) {
        assert!(span.len() >= Self::SIZE);
        let ptr = span.as_ptr() as *mut HeaderPrefix;
        // SAFETY: exclusive access is guaranteed by the allocator handing the
        // slot to exactly one inserter.
        unsafe {
            std::ptr::addr_of_mut!((*ptr).table).write(key.table.0);
            std::ptr::addr_of_mut!((*ptr).row).write(key.row);
        }
        HeaderPrefix::at(span).valid.store(1, Ordering::Release);
    }

    pub fn invalidate(&self) {
        self.valid.store(0, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) != 0
    }

    pub fn key(&self) -> Key {
        Key::new(TableId(self.table), self.row)
    }
}

/// Index entry of the single-version engines: table tag, payload size, and
/// the slot's header/payload spans.
#[derive(Clone, Copy, Debug)]
pub struct TupleRef {
    pub table: TableId,
    pub size: u32,
    pub raw: RawTuple,
}

impl TupleRef {
    pub fn new(table: TableId, size: u32, raw: RawTuple) -> Self {
        Self { table, size, raw }
    }

    pub(crate) fn prefix(&self) -> &HeaderPrefix {
        HeaderPrefix::at(&self.raw.header)
    }
}
