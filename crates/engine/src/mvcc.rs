//! Multi-version concurrency control.
//!
//! Every tuple header carries a fixed-capacity ring of prior versions;
//! readers walk the ring backward to the newest version whose write
//! timestamp is at or below their start timestamp and never block writers.
//! Updaters validate against the newest version's read timestamp, publish a
//! fresh version slot, and recycle slots older than the minimum start
//! timestamp across live workers.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use pmtx_pmem::{fence, Key, RawTuple, Span, Store, StoreConfig, TableId, TableSchema};
use pmtx_wal::{LogManager, LogPage, START_LEN};

use crate::{
    context::{AlignedBytes, Status, TxContext, WriteKind},
    latch::RwLatch,
    logio::{alloc_page_spin, append_tx_records, BaseWorker},
    metrics::{MetricsHub, Phase},
    tuple::HeaderPrefix,
    Clock, ConcurrencyControl, Error, Options, TsRegisters, DEFAULT_LOG_PAGE,
};

/// Version-ring capacity per tuple.
pub const VERSION_RING: u32 = 32;

const NO_TS: u64 = u64::MAX;

#[repr(C)]
struct VersionSlot {
    rts: AtomicU64,
    wts: AtomicU64,
    /// Address of the version payload in the version slab; 0 when empty.
    ptr: AtomicUsize,
}

#[repr(C)]
struct MvccHeader {
    prefix: HeaderPrefix,
    latch: RwLatch,
    insert_ts: AtomicU64,
    delete_ts: AtomicU64,
    oldest: AtomicU32,
    next: AtomicU32,
    ring: [VersionSlot; VERSION_RING as usize],
}

impl MvccHeader {
    const SIZE: u32 = std::mem::size_of::<MvccHeader>() as u32;

    fn at(span: &Span) -> &MvccHeader {
        debug_assert!(span.len() >= Self::SIZE as usize);
        // SAFETY: slab header bytes sized and aligned for this overlay.
        unsafe { &*(span.as_ptr() as *const MvccHeader) }
    }

    fn init(raw: &RawTuple, key: Key, ts: u64, first_version: usize) {
        raw.header.slice(0, Self::SIZE as usize).fill(0);
        let hdr = Self::at(&raw.header);
        hdr.latch.init();
        hdr.insert_ts.store(ts, Ordering::Relaxed);
        hdr.delete_ts.store(NO_TS, Ordering::Relaxed);
        hdr.oldest.store(0, Ordering::Relaxed);
        hdr.ring[0].rts.store(ts, Ordering::Relaxed);
        hdr.ring[0].wts.store(ts, Ordering::Relaxed);
        hdr.ring[0].ptr.store(first_version, Ordering::Relaxed);
        hdr.next.store(1, Ordering::Release);
        HeaderPrefix::init(&raw.header, key);
    }

    fn live(&self) -> (u32, u32, u32) {
        let oldest = self.oldest.load(Ordering::Acquire);
        let next = self.next.load(Ordering::Acquire);
        let count = (next + VERSION_RING - oldest) % VERSION_RING;
        (oldest, next, count)
    }

    fn newest(&self) -> &VersionSlot {
        let next = self.next.load(Ordering::Acquire);
        &self.ring[((next + VERSION_RING - 1) % VERSION_RING) as usize]
    }

    /// Newest version with `wts <= ts`, scanning backward from the newest
    /// slot.
    fn version_at(&self, ts: u64) -> Option<usize> {
        let (oldest, next, count) = self.live();
        let _ = next;
        for back in 1..=count {
            let idx = (oldest + count - back) % VERSION_RING;
            let slot = &self.ring[idx as usize];
            if slot.wts.load(Ordering::Acquire) <= ts {
                let addr = slot.ptr.load(Ordering::Acquire);
                return (addr != 0).then_some(addr);
            }
        }
        None
    }

    fn validate_update(&self, ts: u64) -> bool {
        self.newest().rts.load(Ordering::Acquire) <= ts
    }

    fn has_room(&self) -> bool {
        let (oldest, next, _) = self.live();
        (next + 1) % VERSION_RING != oldest
    }

    /// Publish order: payload is already copied; store the pointer, then the
    /// timestamps, then advance the cursor, all with release ordering.
    fn add_version(&self, addr: usize, ts: u64) {
        let next = self.next.load(Ordering::Acquire);
        let slot = &self.ring[next as usize];
        slot.ptr.store(addr, Ordering::Release);
        slot.wts.store(ts, Ordering::Release);
        slot.rts.store(ts, Ordering::Release);
        self.next.store((next + 1) % VERSION_RING, Ordering::Release);
    }

    /// Whether any slot is strictly older than the watermark (the oldest
    /// slot itself must stay as long as the second-oldest is newer).
    fn needs_reclaim(&self, min_ts: u64) -> bool {
        let (oldest, _, count) = self.live();
        if count < 2 {
            return false;
        }
        let second = &self.ring[((oldest + 1) % VERSION_RING) as usize];
        second.wts.load(Ordering::Relaxed) < min_ts
    }

    /// Retire slots unreachable below `min_ts`. Caller holds the write
    /// latch.
    fn reclaim(&self, min_ts: u64, mut free: impl FnMut(usize)) {
        loop {
            let (oldest, _, count) = self.live();
            if count < 2 {
                return;
            }
            let second = &self.ring[((oldest + 1) % VERSION_RING) as usize];
            if second.wts.load(Ordering::Relaxed) >= min_ts {
                return;
            }
            let slot = &self.ring[oldest as usize];
            let addr = slot.ptr.swap(0, Ordering::AcqRel);
            if addr != 0 {
                free(addr);
            }
            self.oldest.store((oldest + 1) % VERSION_RING, Ordering::Release);
        }
    }
}

/// Index entry: table tag, payload size, header slot span.
#[derive(Clone, Copy, Debug)]
pub struct MvccRef {
    pub table: TableId,
    pub size: u32,
    pub header: Span,
}

type Ctx = TxContext<MvccRef, Option<Span>>;

pub struct MvccWorker {
    base: BaseWorker,
    registers: Arc<TsRegisters>,
}

impl Drop for MvccWorker {
    fn drop(&mut self) {
        self.registers.clear(self.base.tid);
    }
}

pub struct Mvcc {
    store: Store<MvccRef>,
    wal: LogManager,
    clock: Clock,
    registers: Arc<TsRegisters>,
    hub: MetricsHub,
}

impl Mvcc {
    pub fn open(opts: &Options, schemas: &[TableSchema]) -> Result<Self, Error> {
        let config = StoreConfig {
            path: opts.path.clone(),
            log_bytes: opts.log_bytes(),
            header_size: MvccHeader::SIZE,
            with_versions: true,
        };
        let store = Store::open(&config, schemas)?;
        let wal = LogManager::create(store.log_span(), DEFAULT_LOG_PAGE)?;
        Ok(Self {
            store,
            wal,
            clock: Clock::new(),
            registers: Arc::new(TsRegisters::new()),
            hub: MetricsHub::default(),
        })
    }

    fn read_index(&self, ctx: &mut Ctx, key: Key) -> Option<MvccRef> {
        ctx.timings.start(Phase::Index);
        let tuple = self.store.read_index(key);
        ctx.timings.end(Phase::Index);
        tuple
    }

    fn alloc_version_for(&self, hdr: &MvccHeader, table: TableId) -> Option<Span> {
        if let Some(span) = self.store.alloc_version(table) {
            return Some(span);
        }
        // The slab is dry; recycling this tuple's own tail may free one.
        let min_ts = self.registers.min();
        hdr.reclaim(min_ts, |addr| {
            // SAFETY: addresses in the ring come from this table's slab.
            self.store.free_version(table, unsafe { Span::from_raw(addr as *mut u8, 0) });
        });
        self.store.alloc_version(table)
    }

    fn write_log(&self, worker: &mut BaseWorker, ctx: &mut Ctx) -> LogPage {
        ctx.timings.start(Phase::PersistLog);
        let total = START_LEN + ctx.log_record_bytes();
        if let Err(e) = self.wal.check_budget(total) {
            panic!("fatal log configuration: {e}");
        }
        let mut page = alloc_page_spin(&self.wal, &mut worker.cursor);
        append_tx_records(&mut page, ctx.commit_ts, &ctx.write_set);
        page.flush_from(0);
        fence();
        ctx.timings.end(Phase::PersistLog);
        page
    }

    fn apply(&self, ctx: &mut Ctx) {
        ctx.timings.start(Phase::PersistData);
        let ts = ctx.commit_ts;

        for entry in &mut ctx.write_set {
            match entry.kind {
                WriteKind::Update => {
                    let tuple = entry.tuple.expect("update entry without tuple");
                    let version = entry.extra.take().expect("update entry without reserved version");
                    version.write_from(0, &entry.buf);
                    version.flush(0, entry.buf.len());
                    MvccHeader::at(&tuple.header).add_version(version.as_ptr() as usize, ts);
                }
                WriteKind::Insert => {
                    let raw = match self.store.alloc_tuple(entry.key.table) {
                        Some(raw) => raw,
                        None => panic!("{} capacity exhausted", entry.key.table),
                    };
                    let version = match self.store.alloc_version(entry.key.table) {
                        Some(span) => span,
                        None => panic!("{} version capacity exhausted", entry.key.table),
                    };
                    version.write_from(0, &entry.buf);
                    version.flush(0, entry.buf.len());
                    MvccHeader::init(&raw, entry.key, ts, version.as_ptr() as usize);
                    raw.header.flush(0, MvccHeader::SIZE as usize);
                    let tuple = MvccRef {
                        table: entry.key.table,
                        size: entry.size,
                        header: raw.header,
                    };
                    if self.store.insert_index(entry.key, tuple) {
                        entry.tuple = Some(tuple);
                    } else {
                        HeaderPrefix::at(&raw.header).invalidate();
                        self.store.free_version(entry.key.table, version);
                        self.store.free_tuple(entry.key.table, raw);
                    }
                }
                WriteKind::Delete => {
                    let tuple = entry.tuple.expect("delete entry without tuple");
                    let hdr = MvccHeader::at(&tuple.header);
                    hdr.delete_ts.store(ts, Ordering::Release);
                    tuple.header.flush(0, MvccHeader::SIZE as usize);
                }
            }
        }
        fence();
        ctx.timings.end(Phase::PersistData);
    }

    fn version_size(&self, tuple: &MvccRef) -> usize {
        tuple.size as usize
    }
}

impl ConcurrencyControl for Mvcc {
    type Worker = MvccWorker;
    type Context = Ctx;

    const NAME: &'static str = "mvcc";

    fn spawn_worker(&self, tid: u32) -> MvccWorker {
        MvccWorker {
            base: BaseWorker::new(&self.hub, tid),
            registers: self.registers.clone(),
        }
    }

    fn begin(&self, worker: &mut MvccWorker, ctx: &mut Ctx) {
        worker.base.recorder.start_tx();
        ctx.timings.arm(worker.base.recorder.recording());
        ctx.timings.start(Phase::Total);
        ctx.timings.start(Phase::Running);
        ctx.status = Status::Running;
        ctx.commit_ts = self.clock.next();
        self.registers.publish(worker.base.tid, ctx.commit_ts);
    }

    fn read_into(&self, _worker: &mut MvccWorker, ctx: &mut Ctx, key: Key, dst: &mut [u8], offset: u32) -> bool {
        if let Some(entry) = ctx.find_write(key) {
            if entry.kind == WriteKind::Delete {
                return false;
            }
            let off = offset as usize;
            if off + dst.len() > entry.buf.len() {
                return false;
            }
            dst.copy_from_slice(&entry.buf[off..off + dst.len()]);
            return true;
        }
        let start_ts = ctx.commit_ts;
        let Some(tuple) = self.read_index(ctx, key) else {
            return false;
        };
        if offset as usize + dst.len() > tuple.size as usize {
            return false;
        }
        let hdr = MvccHeader::at(&tuple.header);
        if hdr.delete_ts.load(Ordering::Acquire) <= start_ts {
            return false;
        }
        let Some(addr) = hdr.version_at(start_ts) else {
            return false;
        };
        // SAFETY: version addresses point into this table's version slab.
        let version = unsafe { Span::from_raw(addr as *mut u8, self.version_size(&tuple)) };
        version.read_into(offset as usize, dst);
        true
    }

    fn update<'c>(&self, _worker: &mut MvccWorker, ctx: &'c mut Ctx, key: Key, size: u32, offset: u32) -> Option<&'c mut [u8]> {
        if ctx.find_write(key).is_some_and(|e| e.kind == WriteKind::Delete) {
            return None;
        }
        let start_ts = ctx.commit_ts;
        let tuple = self.read_index(ctx, key)?;
        if offset + size > tuple.size {
            return None;
        }
        let hdr = MvccHeader::at(&tuple.header);
        if hdr.delete_ts.load(Ordering::Acquire) <= start_ts {
            return None;
        }
        // A newer reader already passed this version; committing would
        // serialize behind it.
        if !hdr.validate_update(start_ts) {
            return None;
        }
        let addr = hdr.version_at(start_ts)?;
        let mut buf = AlignedBytes::zeroed(tuple.size as usize);
        // SAFETY: as in `read_into`.
        unsafe { Span::from_raw(addr as *mut u8, tuple.size as usize) }.read_into(0, &mut buf);
        let entry = ctx.access_update(key, start_ts, tuple, buf, size, offset, None);
        Some(&mut entry.buf[offset as usize..(offset + size) as usize])
    }

    fn insert(&self, _worker: &mut MvccWorker, ctx: &mut Ctx, key: Key, src: &[u8]) -> bool {
        if ctx.find_write(key).is_some() {
            return false;
        }
        if self.read_index(ctx, key).is_some() {
            return false;
        }
        ctx.access_insert(key, src, None);
        true
    }

    fn remove(&self, _worker: &mut MvccWorker, ctx: &mut Ctx, key: Key) -> bool {
        if ctx.find_write(key).is_some_and(|e| e.kind == WriteKind::Delete) {
            return false;
        }
        let start_ts = ctx.commit_ts;
        let Some(tuple) = self.read_index(ctx, key) else {
            return false;
        };
        if MvccHeader::at(&tuple.header).delete_ts.load(Ordering::Acquire) <= start_ts {
            return false;
        }
        ctx.access_delete(key, start_ts, tuple, None);
        true
    }

    fn commit(&self, worker: &mut MvccWorker, ctx: &mut Ctx) -> bool {
        ctx.timings.end(Phase::Running);
        ctx.timings.start(Phase::Commit);
        ctx.timings.start(Phase::Validate);
        ctx.status = Status::Validating;

        let start_ts = ctx.commit_ts;
        let has_write = ctx.has_writes();
        let mut ok = !ctx.doomed;
        let mut locked = 0usize;

        if has_write && ok {
            ctx.sort_write_set();

            let mut last: Option<Key> = None;
            for entry in &mut ctx.write_set {
                if entry.kind == WriteKind::Insert || last == Some(entry.key) {
                    continue;
                }
                let tuple = entry.tuple.expect("write entry without tuple");
                let hdr = MvccHeader::at(&tuple.header);
                if !hdr.validate_update(start_ts) {
                    ok = false;
                    break;
                }
                hdr.latch.write();
                last = Some(entry.key);
                locked += 1;
                if !hdr.validate_update(start_ts) {
                    ok = false;
                    break;
                }
                if entry.kind == WriteKind::Update {
                    if !hdr.has_room() {
                        let min_ts = self.registers.min();
                        hdr.reclaim(min_ts, |addr| {
                            // SAFETY: ring addresses come from this table's
                            // version slab.
                            self.store
                                .free_version(tuple.table, unsafe { Span::from_raw(addr as *mut u8, 0) });
                        });
                    }
                    if !hdr.has_room() {
                        ok = false;
                        break;
                    }
                    entry.extra = self.alloc_version_for(hdr, tuple.table);
                    if entry.extra.is_none() {
                        ok = false;
                        break;
                    }
                }
            }
        }

        ctx.timings.end(Phase::Validate);
        ctx.status = Status::Committing;

        if has_write {
            if ok {
                let page = self.write_log(&mut worker.base, ctx);
                self.apply(ctx);
                self.wal.release(page);
            }

            let mut last: Option<Key> = None;
            let mut released = 0usize;
            for entry in &mut ctx.write_set {
                if entry.kind == WriteKind::Insert || last == Some(entry.key) {
                    continue;
                }
                if released == locked {
                    break;
                }
                let tuple = entry.tuple.expect("write entry without tuple");
                MvccHeader::at(&tuple.header).latch.unlock_write();
                last = Some(entry.key);
                released += 1;
                if !ok {
                    if let Some(reserved) = entry.extra.take() {
                        self.store.free_version(tuple.table, reserved);
                    }
                }
            }

            // Opportunistic reclamation of the tuples this transaction
            // touched.
            let min_ts = self.registers.min();
            for entry in &ctx.write_set {
                let Some(tuple) = entry.tuple else { continue };
                if entry.kind == WriteKind::Insert {
                    continue;
                }
                let hdr = MvccHeader::at(&tuple.header);
                if hdr.needs_reclaim(min_ts) && hdr.latch.try_write() {
                    hdr.reclaim(min_ts, |addr| {
                        // SAFETY: as above.
                        self.store
                            .free_version(tuple.table, unsafe { Span::from_raw(addr as *mut u8, 0) });
                    });
                    hdr.latch.unlock_write();
                }
            }
        }

        ctx.timings.end(Phase::Commit);
        ctx.timings.end(Phase::Total);
        ctx.status = if ok { Status::Committed } else { Status::Aborted };
        if ok {
            worker.base.recorder.submit(&ctx.timings);
        }
        ok
    }

    fn abort(&self, worker: &mut MvccWorker, ctx: &mut Ctx) -> bool {
        worker.base.recorder.abort_tx();
        match ctx.status {
            Status::Running => ctx.timings.end(Phase::Running),
            Status::Validating => ctx.timings.end(Phase::Validate),
            _ => {}
        }
        worker.base.recorder.submit(&ctx.timings);
        ctx.status = Status::Aborted;
        true
    }

    fn reset(&self, worker: &mut MvccWorker, ctx: &mut Ctx) -> bool {
        ctx.clear();
        self.begin(worker, ctx);
        true
    }

    fn flush_all(&self) {
        fence();
    }

    fn metrics(&self) -> &MetricsHub {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Execute, Executor};

    fn engine() -> Mvcc {
        let schemas = [TableSchema {
            tuple_size: 8,
            max_tuples: 64,
        }];
        Mvcc::open(
            &Options {
                log_bytes: 1 << 20,
                ..Options::default()
            },
            &schemas,
        )
        .unwrap()
    }

    #[test]
    fn ring_returns_newest_visible_version() {
        let region = pmtx_pmem::Region::anonymous(4096).unwrap();
        let slab = pmtx_pmem::Slab::new(region.span(), MvccHeader::SIZE, 8, 1);
        let raw = slab.alloc().unwrap();
        MvccHeader::init(&raw, Key::new(TableId(0), 1), 2, 0x100);
        let hdr = MvccHeader::at(&raw.header);
        hdr.add_version(0x200, 5);
        hdr.add_version(0x300, 8);

        assert_eq!(hdr.version_at(6), Some(0x200));
        assert_eq!(hdr.version_at(8), Some(0x300));
        assert_eq!(hdr.version_at(2), Some(0x100));
        assert_eq!(hdr.version_at(1), None);
        // Ring wts values stay strictly increasing along the ring.
        let (oldest, _, count) = hdr.live();
        let mut prev = 0;
        for i in 0..count {
            let wts = hdr.ring[((oldest + i) % VERSION_RING) as usize].wts.load(Ordering::Relaxed);
            assert!(wts > prev);
            prev = wts;
        }
    }

    #[test]
    fn snapshot_reads_ignore_later_commits() {
        let cc = engine();
        let k = Key::new(TableId(0), 1);
        let mut w0 = cc.spawn_worker(0);
        let mut w1 = cc.spawn_worker(1);

        let mut load = Executor::begin(&cc, &mut w0);
        assert!(load.insert(k, &[1u8; 8]));
        assert!(load.commit());

        // Reader starts before the updater commits.
        let mut reader = Executor::begin(&cc, &mut w0);
        let mut buf = [0u8; 8];
        assert!(reader.read_at(k, &mut buf, 0));
        assert_eq!(buf, [1u8; 8]);

        let mut writer = Executor::begin(&cc, &mut w1);
        assert!(writer.update_at(k, &[2u8; 8], 0));
        assert!(writer.commit());

        // Same snapshot on re-read.
        let mut buf2 = [0u8; 8];
        assert!(reader.read_at(k, &mut buf2, 0));
        assert_eq!(buf2, [1u8; 8]);
        assert!(reader.commit());

        // A transaction starting after the update sees the new value.
        let mut late = Executor::begin(&cc, &mut w0);
        assert!(late.read_at(k, &mut buf, 0));
        assert_eq!(buf, [2u8; 8]);
        assert!(late.commit());
    }

    #[test]
    fn stale_updater_aborts_behind_newer_reader() {
        let cc = engine();
        let k = Key::new(TableId(0), 2);
        let mut w0 = cc.spawn_worker(0);
        let mut w1 = cc.spawn_worker(1);

        let mut load = Executor::begin(&cc, &mut w0);
        assert!(load.insert(k, &[0u8; 8]));
        assert!(load.commit());

        // Old transaction stages an update.
        let mut old = Executor::begin(&cc, &mut w0);
        assert!(old.update_at(k, &[1u8; 8], 0));

        // A newer writer advances the newest version's stamps.
        let mut newer = Executor::begin(&cc, &mut w1);
        assert!(newer.update_at(k, &[2u8; 8], 0));
        assert!(newer.commit());

        assert!(!old.commit());
        old.abort();
    }
}
