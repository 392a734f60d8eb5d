//! TicToc concurrency control.
//!
//! Each tuple carries a read timestamp (`rts`, latest read-through) next to
//! its write timestamp. Instead of validating against a fixed global order,
//! commit negotiates a timestamp that linearizes the transaction: every
//! written tuple forces `commit_ts > rts`, every read tuple advances its
//! `rts` up to `commit_ts`.

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
    ConcurrencyControl, Error, Options, DEFAULT_LOG_PAGE,
};

#[repr(C)]
struct TicTocHeader {
    prefix: HeaderPrefix,
    rts: AtomicU64,
    wts: AtomicU64,
    latch: RwLatch,
}

impl TicTocHeader {
    const SIZE: u32 = std::mem::size_of::<TicTocHeader>() as u32;

    fn at(tuple: &TupleRef) -> &TicTocHeader {
        debug_assert!(tuple.raw.header.len() >= Self::SIZE as usize);
        // SAFETY: slab header bytes sized and aligned for this overlay.
        unsafe { &*(tuple.raw.header.as_ptr() as *const TicTocHeader) }
    }

    fn init(raw: &RawTuple, key: Key, ts: u64) {
        let hdr = unsafe { &*(raw.header.as_ptr() as *const TicTocHeader) };
        hdr.rts.store(ts, Ordering::Relaxed);
        hdr.wts.store(ts, Ordering::Relaxed);
        hdr.latch.init();
        HeaderPrefix::init(&raw.header, key);
    }
}

type Ctx = TxContext<TupleRef>;

pub struct TicToc {
    store: Store<TupleRef>,
    wal: LogManager,
    hub: MetricsHub,
}

impl TicToc {
    pub fn open(opts: &Options, schemas: &[TableSchema]) -> Result<Self, Error> {
        let store = Store::open(&Self::store_config(opts), schemas)?;
        let wal = LogManager::create(store.log_span(), DEFAULT_LOG_PAGE)?;
        Ok(Self {
            store,
            wal,
            hub: MetricsHub::default(),
        })
    }

    pub fn recover(opts: &Options, schemas: &[TableSchema]) -> Result<(Self, Vec<RecoveredTx>, RecoveryStats), Error> {
        let store = Store::open(&Self::store_config(opts), schemas)?;
        let wal = LogManager::recover(store.log_span(), DEFAULT_LOG_PAGE)?;

        let mut stats = RecoveryStats::default();
        recovery::rebuild_tables(&store, &mut stats, |table, raw| {
            let hdr = unsafe { &*(raw.header.as_ptr() as *const TicTocHeader) };
            hdr.latch.init();
            TupleRef::new(table, raw.data.len() as u32, raw)
        });
        let txs = recovery::replay_log(&wal, &mut stats);

        let this = Self {
            store,
            wal,
            hub: MetricsHub::default(),
        };
        Ok((this, txs, stats))
    }

    fn store_config(opts: &Options) -> StoreConfig {
        StoreConfig {
            path: opts.path.clone(),
            log_bytes: opts.log_bytes(),
            header_size: TicTocHeader::SIZE,
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

    fn apply(&self, ctx: &mut Ctx) -> SmallVec<[TupleRef; 2]> {
        ctx.timings.start(Phase::PersistData);
        let commit_ts = ctx.commit_ts;
        let mut freed = SmallVec::new();

        for entry in &mut ctx.write_set {
            match entry.kind {
                WriteKind::Update => {
                    let tuple = entry.tuple.expect("update entry without tuple");
                    let hdr = TicTocHeader::at(&tuple);
                    let (off, len) = (entry.offset as usize, entry.size as usize);
                    tuple.raw.data.write_from(off, &entry.buf[off..off + len]);
                    tuple.raw.data.flush(off, len);
                    fence();
                    // rts before wts, mirroring the wts-before-rts read order
                    // in validation.
                    hdr.rts.store(commit_ts, Ordering::Release);
                    hdr.wts.store(commit_ts, Ordering::Release);
                }
                WriteKind::Insert => {
                    let raw = match self.store.alloc_tuple(entry.key.table) {
                        Some(raw) => raw,
                        None => panic!("{} capacity exhausted", entry.key.table),
                    };
                    raw.data.write_from(0, &entry.buf);
                    TicTocHeader::init(&raw, entry.key, commit_ts);
                    raw.data.flush(0, entry.buf.len());
                    raw.header.flush(0, TicTocHeader::SIZE as usize);
                    let tuple = TupleRef::new(entry.key.table, entry.size, raw);
                    if self.store.insert_index(entry.key, tuple) {
                        entry.tuple = Some(tuple);
                    } else {
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

impl ConcurrencyControl for TicToc {
    type Worker = BaseWorker;
    type Context = Ctx;

    const NAME: &'static str = "tictoc";

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
        let wts = TicTocHeader::at(&tuple).wts.load(Ordering::Acquire);
        // The commit timestamp can never go below any read version.
        ctx.commit_ts = ctx.commit_ts.max(wts);
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
        let wts = TicTocHeader::at(&tuple).wts.load(Ordering::Acquire);
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
        let wts = TicTocHeader::at(&tuple).wts.load(Ordering::Acquire);
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

            let mut last: Option<Key> = None;
            for entry in &ctx.write_set {
                if entry.kind == WriteKind::Insert || last == Some(entry.key) {
                    continue;
                }
                let tuple = entry.tuple.expect("write entry without tuple");
                let hdr = TicTocHeader::at(&tuple);
                hdr.latch.write();
                last = Some(entry.key);
                locked += 1;
                // wts before rts, matching the apply order rts-then-wts.
                let wts = hdr.wts.load(Ordering::Acquire);
                let rts = hdr.rts.load(Ordering::Acquire);
                if rts < wts || entry.wts != wts {
                    ok = false;
                    break;
                }
                ctx.commit_ts = ctx.commit_ts.max(rts + 1);
            }

            if ok {
                for entry in &ctx.read_set {
                    let hdr = TicTocHeader::at(&entry.tuple);
                    if !hdr.latch.try_read() {
                        if !key_in_writes(&ctx.write_set, entry.key) {
                            ok = false;
                            break;
                        }
                        // Its rts advances with the write itself.
                        continue;
                    }
                    let wts = hdr.wts.load(Ordering::Acquire);
                    if wts != entry.wts {
                        hdr.latch.unlock_read();
                        ok = false;
                        break;
                    }
                    // Advance rts to cover this transaction's serialization
                    // point.
                    let mut rts = hdr.rts.load(Ordering::Acquire);
                    while ctx.commit_ts > rts {
                        match hdr
                            .rts
                            .compare_exchange(rts, ctx.commit_ts, Ordering::AcqRel, Ordering::Acquire)
                        {
                            Ok(_) => break,
                            Err(seen) => rts = seen,
                        }
                    }
                    hdr.latch.unlock_read();
                }
            }
        }

        ctx.timings.end(Phase::Validate);
        ctx.status = Status::Committing;

        if has_write {
            let mut freed = SmallVec::<[TupleRef; 2]>::new();
            if ok {
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
                TicTocHeader::at(&tuple).latch.unlock_write();
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

    fn engine() -> TicToc {
        let schemas = [TableSchema {
            tuple_size: 8,
            max_tuples: 64,
        }];
        TicToc::open(
            &Options {
                log_bytes: 1 << 20,
                ..Options::default()
            },
            &schemas,
        )
        .unwrap()
    }

    fn stamps(cc: &TicToc, key: Key) -> (u64, u64) {
        let tuple = cc.store.read_index(key).unwrap();
        let hdr = TicTocHeader::at(&tuple);
        (hdr.wts.load(Ordering::Acquire), hdr.rts.load(Ordering::Acquire))
    }

    fn force_stamps(cc: &TicToc, key: Key, wts: u64, rts: u64) {
        let tuple = cc.store.read_index(key).unwrap();
        let hdr = TicTocHeader::at(&tuple);
        hdr.wts.store(wts, Ordering::Release);
        hdr.rts.store(rts, Ordering::Release);
    }

    /// Reading k1 pins the commit timestamp above its wts; writing k2 then
    /// commits at `max(read wts, k2.rts + 1)` and advances k1's rts.
    #[test]
    fn commit_negotiates_timestamp_and_advances_rts() {
        let cc = engine();
        let k1 = Key::new(TableId(0), 1);
        let k2 = Key::new(TableId(0), 2);

        let mut w = cc.spawn_worker(0);
        let mut load = Executor::begin(&cc, &mut w);
        assert!(load.insert(k1, &[0u8; 8]));
        assert!(load.insert(k2, &[0u8; 8]));
        assert!(load.commit());

        force_stamps(&cc, k1, 5, 5);
        force_stamps(&cc, k2, 3, 5);

        let mut tx = Executor::begin(&cc, &mut w);
        let mut buf = [0u8; 8];
        assert!(tx.read_at(k1, &mut buf, 0));
        assert!(tx.update_at(k2, &[1u8; 8], 0));
        assert!(tx.commit());

        // commit_ts = max(read wts 5, k2.rts + 1) = 6.
        assert_eq!(stamps(&cc, k1), (5, 6));
        assert_eq!(stamps(&cc, k2), (6, 6));
    }

    #[test]
    fn write_write_conflict_aborts_stale_writer() {
        let cc = engine();
        let k = Key::new(TableId(0), 3);
        let mut w0 = cc.spawn_worker(0);
        let mut w1 = cc.spawn_worker(1);

        let mut load = Executor::begin(&cc, &mut w0);
        assert!(load.insert(k, &[0u8; 8]));
        assert!(load.commit());

        let mut t1 = Executor::begin(&cc, &mut w0);
        assert!(t1.update_at(k, &[1u8; 8], 0));

        let mut t2 = Executor::begin(&cc, &mut w1);
        assert!(t2.update_at(k, &[2u8; 8], 0));
        assert!(t2.commit());

        assert!(!t1.commit());
        t1.abort();

        let mut check = Executor::begin(&cc, &mut w0);
        let mut buf = [0u8; 8];
        assert!(check.read_at(k, &mut buf, 0));
        assert_eq!(buf, [2u8; 8]);
    }
}
