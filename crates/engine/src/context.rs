use std::ops::{Deref, DerefMut};

use pmtx_pmem::Key;
use pmtx_wal::{insert_len, update_len, DELETE_LEN};
use smallvec::SmallVec;

use crate::metrics::TxTimings;

/// Transaction-private byte buffer, 8-byte aligned so typed views over it
/// stay aligned.
pub struct AlignedBytes {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedBytes {
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(8)].into_boxed_slice(),
            len,
        }
    }

    pub fn copy_from(src: &[u8]) -> Self {
        let mut buf = Self::zeroed(src.len());
        buf.as_mut_slice().copy_from_slice(src);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

impl Deref for AlignedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Running,
    Validating,
    Committing,
    Committed,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    Update,
    Insert,
    Delete,
}

/// Witness of a read: the write timestamp observed before the payload copy.
pub struct ReadEntry<H> {
    pub wts: u64,
    pub key: Key,
    pub tuple: H,
}

/// A pending mutation. For updates `buf` holds the full tuple image (the
/// pre-image plus this transaction's in-place edits) and `[offset,
/// offset + size)` is the range actually changed; for inserts `buf` is the
/// new payload; deletes carry no bytes.
pub struct WriteEntry<H, X = ()> {
    pub kind: WriteKind,
    pub wts: u64,
    pub key: Key,
    pub offset: u32,
    pub size: u32,
    pub buf: AlignedBytes,
    pub tuple: Option<H>,
    pub extra: X,
}

/// Per-transaction accumulator: read witnesses, pending writes, log-size
/// estimate and the phase stopwatch.
///
/// `H` is the engine's tuple handle, `X` an engine-specific rider on write
/// entries (the Courier-Save cache guard; `()` elsewhere).
pub struct TxContext<H, X = ()> {
    pub status: Status,
    /// Set by engines whose access paths can already rule out a successful
    /// commit (latch refusal in TPL); checked at commit.
    pub doomed: bool,
    pub commit_ts: u64,
    pub read_set: SmallVec<[ReadEntry<H>; 16]>,
    pub write_set: Vec<WriteEntry<H, X>>,
    pub timings: TxTimings,
    log_bytes: usize,
}

impl<H, X> Default for TxContext<H, X> {
    fn default() -> Self {
        Self {
            status: Status::Running,
            doomed: false,
            commit_ts: 0,
            read_set: SmallVec::new(),
            write_set: Vec::with_capacity(16),
            timings: TxTimings::default(),
            log_bytes: 0,
        }
    }
}

impl<H: Copy, X> TxContext<H, X> {
    /// Drop all accumulated state for another run of the same transaction.
    pub fn clear(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
        self.log_bytes = 0;
        self.commit_ts = 0;
        self.doomed = false;
        self.status = Status::Running;
    }

    /// Most recent write entry for `key`, if any. Read-your-own-writes
    /// resolves against this before touching shared state.
    pub fn find_write(&mut self, key: Key) -> Option<&mut WriteEntry<H, X>> {
        self.write_set.iter_mut().rev().find(|e| e.key == key)
    }

    pub fn has_writes(&self) -> bool {
        !self.write_set.is_empty()
    }

    /// Upper bound on the log bytes this transaction appends, excluding the
    /// commit record (and the start record, which the engine adds).
    pub fn log_record_bytes(&self) -> usize {
        self.log_bytes
    }

    pub fn access_read(&mut self, key: Key, wts: u64, tuple: H) {
        self.read_set.push(ReadEntry { wts, key, tuple });
    }

    /// Record an update of `[offset, offset + size)`. A repeated update of
    /// the same key folds into the earlier entry, widening its range, so one
    /// committer never latches the same tuple twice.
    pub fn access_update(
        &mut self,
        key: Key,
        wts: u64,
        tuple: H,
        buf: AlignedBytes,
        size: u32,
        offset: u32,
        extra: X,
    ) -> &mut WriteEntry<H, X> {
        if let Some(idx) = self.write_set.iter().rposition(|e| e.key == key) {
            if self.write_set[idx].kind == WriteKind::Update {
                let entry = &mut self.write_set[idx];
                let start = entry.offset.min(offset);
                let end = (entry.offset + entry.size).max(offset + size);
                self.log_bytes += update_len(end - start) - update_len(entry.size);
                entry.offset = start;
                entry.size = end - start;
                return &mut self.write_set[idx];
            }
        }
        self.log_bytes += update_len(size);
        self.write_set.push(WriteEntry {
            kind: WriteKind::Update,
            wts,
            key,
            offset,
            size,
            buf,
            tuple: Some(tuple),
            extra,
        });
        self.write_set.last_mut().unwrap()
    }

    pub fn access_insert(&mut self, key: Key, src: &[u8], extra: X) -> &mut WriteEntry<H, X> {
        self.log_bytes += insert_len(src.len() as u32);
        self.write_set.push(WriteEntry {
            kind: WriteKind::Insert,
            wts: 0,
            key,
            offset: 0,
            size: src.len() as u32,
            buf: AlignedBytes::copy_from(src),
            tuple: None,
            extra,
        });
        self.write_set.last_mut().unwrap()
    }

    pub fn access_delete(&mut self, key: Key, wts: u64, tuple: H, extra: X) {
        self.log_bytes += DELETE_LEN;
        self.write_set.push(WriteEntry {
            kind: WriteKind::Delete,
            wts,
            key,
            offset: 0,
            size: 0,
            buf: AlignedBytes::zeroed(0),
            tuple: Some(tuple),
            extra,
        });
    }

    /// Sort pending writes by key so concurrent committers latch tuples in a
    /// global order. The sort is stable; a transaction's operations on one
    /// key keep their program order.
    pub fn sort_write_set(&mut self) {
        self.write_set.sort_by_key(|e| e.key);
    }
}

/// Whether `key` has a pending write in `write_set` (duplicate read/write
/// set resolution during validation, where the context itself is already
/// borrowed).
pub(crate) fn key_in_writes<H, X>(write_set: &[WriteEntry<H, X>], key: Key) -> bool {
    write_set.iter().any(|e| e.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmtx_pmem::TableId;
    use pretty_assertions::assert_eq;

    type Ctx = TxContext<u32>;

    fn key(row: u64) -> Key {
        Key::new(TableId(0), row)
    }

    #[test]
    fn read_your_own_writes() {
        let mut ctx = Ctx::default();
        let buf = AlignedBytes::copy_from(&[1, 2, 3, 4]);
        ctx.access_update(key(7), 0, 1, buf, 4, 0, ());
        let entry = ctx.find_write(key(7)).unwrap();
        assert_eq!(entry.kind, WriteKind::Update);
        assert_eq!(entry.buf.as_slice(), &[1, 2, 3, 4]);
        assert!(ctx.find_write(key(8)).is_none());
    }

    #[test]
    fn repeated_update_widens_range() {
        let mut ctx = Ctx::default();
        let buf = AlignedBytes::zeroed(64);
        ctx.access_update(key(1), 5, 1, buf, 8, 16, ());
        let before = ctx.log_record_bytes();

        ctx.access_update(key(1), 5, 1, AlignedBytes::zeroed(64), 8, 40, ());
        assert_eq!(ctx.write_set.len(), 1);
        let entry = &ctx.write_set[0];
        assert_eq!(entry.offset, 16);
        assert_eq!(entry.size, 32);
        assert_eq!(ctx.log_record_bytes(), before + 24);
    }

    #[test]
    fn log_size_accumulates_per_kind() {
        let mut ctx = Ctx::default();
        ctx.access_insert(key(1), &[0; 10], ());
        ctx.access_update(key(2), 0, 1, AlignedBytes::zeroed(10), 10, 0, ());
        ctx.access_delete(key(3), 0, 1, ());
        assert_eq!(
            ctx.log_record_bytes(),
            insert_len(10) + update_len(10) + DELETE_LEN
        );
        ctx.clear();
        assert_eq!(ctx.log_record_bytes(), 0);
        assert!(ctx.write_set.is_empty());
    }

    #[test]
    fn sort_is_stable_by_key() {
        let mut ctx = Ctx::default();
        ctx.access_delete(key(9), 0, 1, ());
        ctx.access_update(key(2), 0, 1, AlignedBytes::zeroed(4), 4, 0, ());
        ctx.access_delete(key(2), 1, 1, ());
        ctx.sort_write_set();
        let kinds: Vec<_> = ctx.write_set.iter().map(|e| (e.key.row, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (2, WriteKind::Update),
                (2, WriteKind::Delete),
                (9, WriteKind::Delete)
            ]
        );
    }
}
