//! Optimistic concurrency control.
//!
//! Readers run unlocked against a single in-place version, witnessing the
//! tuple's write timestamp before copying the payload. Commit sorts the write
//! set, latches it, revalidates both sets against the witnessed timestamps,
//! then logs and applies. The payload is always made visible *before* the new
//! timestamp: a reader that saw the old payload also saw the old timestamp,
//! and validation catches it.

use std::sync::atomic::{AtomicU64, Ordering};

use pmtx_pmem::{fence, Key, RawTuple, Store, StoreConfig, TableSchema};
use pmtx_wal::{LogManager, LogPage, START_LEN};
use smallvec::SmallVec;

use crate::{
    context::{key_in_writes, AlignedBytes, Status, TxContext, WriteKind},
    latch::RwLatch,
    logio::{alloc_page_spin, append_tx_records, BaseWorker},
    metrics::{MetricsHub, Phase},
    recovery::{self, RecoveredTx, RecoveryStats},
    tuple::{HeaderPrefix, TupleRef},
    Clock, ConcurrencyControl, Error, Options, DEFAULT_LOG_PAGE,
};

#[repr(C)]
pub(crate) struct OccHeader {
    prefix: HeaderPrefix,
    wts: AtomicU64,
    latch: RwLatch,
}

impl OccHeader {
    pub(crate) const SIZE: u32 = std::mem::size_of::<OccHeader>() as u32;

    pub(crate) fn at(tuple: &TupleRef) -> &OccHeader {
        debug_assert!(tuple.raw.header.len() >= Self::SIZE as usize);
        // SAFETY: the slab allocated `SIZE` header bytes, cache-line aligned.
        unsafe { &*(tuple.raw.header.as_ptr() as *const OccHeader) }
    }

    pub(crate) fn init(raw: &RawTuple, key: Key, wts: u64) {
        let hdr = unsafe { &*(raw.header.as_ptr() as *const OccHeader) };
        hdr.wts.store(wts, Ordering::Relaxed);
        hdr.latch.init();
        // Valid bit last, so a recovery scan never sees a half-built header.
        HeaderPrefix::init(&raw.header, key);
    }
}

type Ctx = TxContext<TupleRef>;

pub struct Occ {
    store: Store<TupleRef>,
    wal: LogManager,
    clock: Clock,
    hub: MetricsHub,
}

impl Occ {
    pub fn open(opts: &Options, schemas: &[TableSchema]) -> Result<Self, Error> {
        let store = Store::open(&Self::store_config(opts), schemas)?;
        let wal = LogManager::create(store.log_span(), DEFAULT_LOG_PAGE)?;
        Ok(Self {
            store,
            wal,
            clock: Clock::new(),
            hub: MetricsHub::default(),
        })
    }

    /// Re-attach to a region written by a previous incarnation: rebuild the
    /// index from the data slabs, then collect the committed log records for
    /// replay through a normal executor.
    pub fn recover(opts: &Options, schemas: &[TableSchema]) -> Result<(Self, Vec<RecoveredTx>, RecoveryStats), Error> {
        let store = Store::open(&Self::store_config(opts), schemas)?;
        let wal = LogManager::recover(store.log_span(), DEFAULT_LOG_PAGE)?;

        let mut stats = RecoveryStats::default();
        recovery::rebuild_tables(&store, &mut stats, |table, raw| {
            let hdr = unsafe { &*(raw.header.as_ptr() as *const OccHeader) };
            hdr.latch.init();
            TupleRef::new(table, raw.data.len() as u32, raw)
        });
        let txs = recovery::replay_log(&wal, &mut stats);

        let this = Self {
            store,
            wal,
            clock: Clock::new(),
            hub: MetricsHub::default(),
        };
        Ok((this, txs, stats))
    }

    fn store_config(opts: &Options) -> StoreConfig {
        StoreConfig {
            path: opts.path.clone(),
            log_bytes: opts.log_bytes(),
            header_size: OccHeader::SIZE,
            with_versions: false,
        }
    }

    fn read_index(&self, ctx: &mut Ctx, key: Key) -> Option<TupleRef> {
        ctx.timings.start(Phase::Index);
        let tuple = self.store.read_index(key);
        ctx.timings.end(Phase::Index);
        tuple
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

    /// Apply the validated write set in place. Deleted slots are only
    /// invalidated and unlinked here; the caller frees them after every latch
    /// is released.
    fn apply(&self, ctx: &mut Ctx) -> SmallVec<[TupleRef; 2]> {
        ctx.timings.start(Phase::PersistData);
        let commit_ts = ctx.commit_ts;
        let mut freed = SmallVec::new();

        for entry in &mut ctx.write_set {
            match entry.kind {
                WriteKind::Update => {
                    let tuple = entry.tuple.expect("update entry without tuple");
                    let (off, len) = (entry.offset as usize, entry.size as usize);
                    // Payload first, flush, fence, then the new timestamp.
                    tuple.raw.data.write_from(off, &entry.buf[off..off + len]);
                    tuple.raw.data.flush(off, len);
                    fence();
                    OccHeader::at(&tuple).wts.store(commit_ts, Ordering::Release);
                }
                WriteKind::Insert => {
                    let raw = match self.store.alloc_tuple(entry.key.table) {
                        Some(raw) => raw,
                        None => panic!("{} capacity exhausted", entry.key.table),
                    };
                    raw.data.write_from(0, &entry.buf);
                    OccHeader::init(&raw, entry.key, commit_ts);
                    raw.data.flush(0, entry.buf.len());
                    raw.header.flush(0, OccHeader::SIZE as usize);
                    let tuple = TupleRef::new(entry.key.table, entry.size, raw);
                    if self.store.insert_index(entry.key, tuple) {
                        entry.tuple = Some(tuple);
                    } else {
                        // Lost an insert race after validation; the index
                        // entry of the winner stays authoritative.
                        HeaderPrefix::at(&raw.header).invalidate();
                        self.store.free_tuple(entry.key.table, raw);
                    }
                }
                WriteKind::Delete => {
                    let tuple = entry.tuple.expect("delete entry without tuple");
                    tuple.prefix().invalidate();
                    tuple.raw.header.flush(0, HeaderPrefix::SIZE);
                    self.store.delete_index(entry.key);
                    freed.push(tuple);
                }
            }
        }
        fence();
        ctx.timings.end(Phase::PersistData);
        freed
    }
}

impl ConcurrencyControl for Occ {
    type Worker = BaseWorker;
    type Context = Ctx;

    const NAME: &'static str = "occ";

    fn spawn_worker(&self, tid: u32) -> BaseWorker {
        BaseWorker::new(&self.hub, tid)
    }

    fn begin(&self, worker: &mut BaseWorker, ctx: &mut Ctx) {
        worker.recorder.start_tx();
        ctx.timings.arm(worker.recorder.recording());
        ctx.timings.start(Phase::Total);
        ctx.timings.start(Phase::Running);
        ctx.status = Status::Running;
    }

    fn read_into(&self, _worker: &mut BaseWorker, ctx: &mut Ctx, key: Key, dst: &mut [u8], offset: u32) -> bool {
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
        let Some(tuple) = self.read_index(ctx, key) else {
            return false;
        };
        if offset as usize + dst.len() > tuple.size as usize {
            return false;
        }
        // Timestamp before payload; the unlocked copy may be torn, which a
        // changed timestamp at validation reveals.
        let wts = OccHeader::at(&tuple).wts.load(Ordering::Acquire);
        ctx.access_read(key, wts, tuple);
        tuple.raw.data.read_into(offset as usize, dst);
        true
    }

    fn update<'c>(&self, _worker: &mut BaseWorker, ctx: &'c mut Ctx, key: Key, size: u32, offset: u32) -> Option<&'c mut [u8]> {
        if ctx.find_write(key).is_some_and(|e| e.kind == WriteKind::Delete) {
            return None;
        }
        let tuple = self.read_index(ctx, key)?;
        if offset + size > tuple.size {
            return None;
        }
        let wts = OccHeader::at(&tuple).wts.load(Ordering::Acquire);
        let mut buf = AlignedBytes::zeroed(tuple.size as usize);
        tuple.raw.data.read_into(0, &mut buf);
        let entry = ctx.access_update(key, wts, tuple, buf, size, offset, ());
        Some(&mut entry.buf[offset as usize..(offset + size) as usize])
    }

    fn insert(&self, _worker: &mut BaseWorker, ctx: &mut Ctx, key: Key, src: &[u8]) -> bool {
        if ctx.find_write(key).is_some() {
            return false;
        }
        if self.read_index(ctx, key).is_some() {
            return false;
        }
        ctx.access_insert(key, src, ());
        true
    }

    fn remove(&self, _worker: &mut BaseWorker, ctx: &mut Ctx, key: Key) -> bool {
        if ctx.find_write(key).is_some_and(|e| e.kind == WriteKind::Delete) {
            return false;
        }
        let Some(tuple) = self.read_index(ctx, key) else {
            return false;
        };
        let wts = OccHeader::at(&tuple).wts.load(Ordering::Acquire);
        ctx.access_delete(key, wts, tuple, ());
        true
    }

    fn commit(&self, worker: &mut BaseWorker, ctx: &mut Ctx) -> bool {
        ctx.timings.end(Phase::Running);
        ctx.timings.start(Phase::Commit);
        ctx.timings.start(Phase::Validate);
        ctx.status = Status::Validating;

        let has_write = ctx.has_writes();
        let mut ok = !ctx.doomed;
        let mut locked = 0usize;

        if has_write && ok {
            ctx.sort_write_set();

            // Write tuples first; a writer sorts ahead of readers of the
            // same key. Duplicate keys are latched once.
            let mut last: Option<Key> = None;
            for entry in &ctx.write_set {
                if entry.kind == WriteKind::Insert {
                    continue;
                }
                if last == Some(entry.key) {
                    continue;
                }
                let tuple = entry.tuple.expect("write entry without tuple");
                let hdr = OccHeader::at(&tuple);
                hdr.latch.write();
                last = Some(entry.key);
                locked += 1;
                if entry.wts != hdr.wts.load(Ordering::Acquire) {
                    ok = false;
                    break;
                }
            }

            if ok {
                for entry in &ctx.read_set {
                    let hdr = OccHeader::at(&entry.tuple);
                    if !hdr.latch.try_read() {
                        // Some committer holds the write latch; tolerable
                        // only when it is this transaction.
                        if !key_in_writes(&ctx.write_set, entry.key) {
                            ok = false;
                            break;
                        }
                        continue;
                    }
                    let wts = hdr.wts.load(Ordering::Acquire);
                    hdr.latch.unlock_read();
                    if wts != entry.wts {
                        ok = false;
                        break;
                    }
                }
            }
        }

        ctx.timings.end(Phase::Validate);
        ctx.status = Status::Committing;

        if has_write {
            let mut freed = SmallVec::<[TupleRef; 2]>::new();
            if ok {
                ctx.commit_ts = self.clock.next();
                let page = self.write_log(worker, ctx);
                freed = self.apply(ctx);
                self.wal.release(page);
            }

            let mut last: Option<Key> = None;
            let mut released = 0usize;
            for entry in &ctx.write_set {
                if entry.kind == WriteKind::Insert || last == Some(entry.key) {
                    continue;
                }
                if released == locked {
                    break;
                }
                let tuple = entry.tuple.expect("write entry without tuple");
                OccHeader::at(&tuple).latch.unlock_write();
                last = Some(entry.key);
                released += 1;
            }

            for tuple in freed {
                self.store.free_tuple(tuple.table, tuple.raw);
            }
        }

        ctx.timings.end(Phase::Commit);
        ctx.timings.end(Phase::Total);
        ctx.status = if ok { Status::Committed } else { Status::Aborted };
        if ok {
            worker.recorder.submit(&ctx.timings);
        }
        ok
    }

    fn abort(&self, worker: &mut BaseWorker, ctx: &mut Ctx) -> bool {
        worker.recorder.abort_tx();
        match ctx.status {
            Status::Running => ctx.timings.end(Phase::Running),
            Status::Validating => ctx.timings.end(Phase::Validate),
            _ => {}
        }
        worker.recorder.submit(&ctx.timings);
        ctx.status = Status::Aborted;
        true
    }

    fn reset(&self, worker: &mut BaseWorker, ctx: &mut Ctx) -> bool {
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
    use pmtx_pmem::TableId;

    fn engine() -> Occ {
        let schemas = [TableSchema {
            tuple_size: 8,
            max_tuples: 128,
        }];
        Occ::open(
            &Options {
                log_bytes: 1 << 20,
                ..Options::default()
            },
            &schemas,
        )
        .unwrap()
    }

    fn seed(cc: &Occ, key: Key, byte: u8) {
        let mut w = cc.spawn_worker(0);
        let mut exec = Executor::begin(cc, &mut w);
        assert!(exec.insert(key, &[byte; 8]));
        assert!(exec.commit());
    }

    #[test]
    fn stale_read_set_aborts_second_committer() {
        let cc = engine();
        let k = Key::new(TableId(0), 1);
        let k2 = Key::new(TableId(0), 11);
        seed(&cc, k, 0);
        seed(&cc, k2, 0);

        let mut w1 = cc.spawn_worker(0);
        let mut w2 = cc.spawn_worker(1);

        // T1 reads k while its wts is the insert timestamp.
        let mut t1 = Executor::begin(&cc, &mut w1);
        let mut buf = [0u8; 8];
        assert!(t1.read_at(k, &mut buf, 0));
        assert_eq!(buf, [0u8; 8]);

        // T2 overwrites k and commits first.
        let mut t2 = Executor::begin(&cc, &mut w2);
        t2.update_at(k, &[1u8; 8], 0);
        assert!(t2.commit());

        // T1 stages a write elsewhere (so validation runs) and must abort on
        // its stale read witness of k.
        t1.update_at(k2, &[9u8; 8], 0);
        assert!(!t1.commit());
        t1.abort();

        let mut w3 = cc.spawn_worker(2);
        let mut check = Executor::begin(&cc, &mut w3);
        let mut buf = [0u8; 8];
        assert!(check.read_at(k, &mut buf, 0));
        assert_eq!(buf, [1u8; 8]);
    }

    #[test]
    fn read_only_commit_skips_validation_and_log() {
        let cc = engine();
        let k = Key::new(TableId(0), 2);
        seed(&cc, k, 5);

        let mut w = cc.spawn_worker(0);
        let mut tx = Executor::begin(&cc, &mut w);
        let mut buf = [0u8; 8];
        assert!(tx.read_at(k, &mut buf, 0));
        assert!(tx.commit());
    }

    #[test]
    fn insert_then_delete_roundtrip() {
        let cc = engine();
        let k = Key::new(TableId(0), 3);
        seed(&cc, k, 7);

        let mut w = cc.spawn_worker(0);
        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.remove(k));
        assert!(tx.commit());

        let mut tx = Executor::begin(&cc, &mut w);
        let mut buf = [0u8; 8];
        assert!(!tx.read_at(k, &mut buf, 0));
        // The key can be inserted again.
        assert!(tx.insert(k, &[8u8; 8]));
        assert!(tx.commit());
    }

    #[test]
    fn read_your_own_write() {
        let cc = engine();
        let k = Key::new(TableId(0), 4);
        seed(&cc, k, 1);

        let mut w = cc.spawn_worker(0);
        let mut tx = Executor::begin(&cc, &mut w);
        tx.update_at(k, &[3u8; 4], 2);
        let mut buf = [0u8; 8];
        assert!(tx.read_at(k, &mut buf, 0));
        assert_eq!(buf, [1, 1, 3, 3, 3, 3, 1, 1]);
        assert!(tx.commit());
    }
}
