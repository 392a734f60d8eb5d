//! Two-phase locking.
//!
//! Latches are taken eagerly at access time and held to the end of the
//! transaction; commit needs no validation. There is no waiting and no
//! deadlock detection: any latch refusal dooms the transaction, which the
//! manager retries. A read latch held by only this transaction is upgraded in
//! place when the same key is written.

use pmtx_pmem::{fence, Key, RawTuple, Store, StoreConfig, TableSchema};
use pmtx_wal::{LogManager, LogPage, START_LEN};
use smallvec::SmallVec;

use crate::{
    context::{AlignedBytes, Status, TxContext, WriteKind},
    latch::RwLatch,
    logio::{alloc_page_spin, append_tx_records, BaseWorker},
    metrics::{MetricsHub, Phase},
    recovery::{self, RecoveredTx, RecoveryStats},
    tuple::{HeaderPrefix, TupleRef},
    Clock, ConcurrencyControl, Error, Options, DEFAULT_LOG_PAGE,
};

#[repr(C)]
struct TplHeader {
    prefix: HeaderPrefix,
    latch: RwLatch,
}

impl TplHeader {
    const SIZE: u32 = std::mem::size_of::<TplHeader>() as u32;

    fn at(tuple: &TupleRef) -> &TplHeader {
        debug_assert!(tuple.raw.header.len() >= Self::SIZE as usize);
        // SAFETY: slab header bytes sized and aligned for this overlay.
        unsafe { &*(tuple.raw.header.as_ptr() as *const TplHeader) }
    }

    fn init(raw: &RawTuple, key: Key) {
        let hdr = unsafe { &*(raw.header.as_ptr() as *const TplHeader) };
        hdr.latch.init();
        HeaderPrefix::init(&raw.header, key);
    }
}

type Ctx = TxContext<TupleRef>;

pub struct Tpl {
    store: Store<TupleRef>,
    wal: LogManager,
    clock: Clock,
    hub: MetricsHub,
}

impl Tpl {
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

    pub fn recover(opts: &Options, schemas: &[TableSchema]) -> Result<(Self, Vec<RecoveredTx>, RecoveryStats), Error> {
        let store = Store::open(&Self::store_config(opts), schemas)?;
        let wal = LogManager::recover(store.log_span(), DEFAULT_LOG_PAGE)?;

        let mut stats = RecoveryStats::default();
        recovery::rebuild_tables(&store, &mut stats, |table, raw| {
            let hdr = unsafe { &*(raw.header.as_ptr() as *const TplHeader) };
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
            header_size: TplHeader::SIZE,
            with_versions: false,
        }
    }

    fn read_index(&self, ctx: &mut Ctx, key: Key) -> Option<TupleRef> {
        ctx.timings.start(Phase::Index);
        let tuple = self.store.read_index(key);
        ctx.timings.end(Phase::Index);
        tuple
    }

    /// Drop every latch this transaction still holds. Entries are
    /// neutralized so a second call is a no-op.
    fn release_all(&self, ctx: &mut Ctx) {
        for entry in ctx.read_set.drain(..) {
            TplHeader::at(&entry.tuple).latch.unlock_read();
        }
        for entry in &mut ctx.write_set {
            if entry.kind == WriteKind::Insert {
                continue;
            }
            if let Some(tuple) = entry.tuple.take() {
                TplHeader::at(&tuple).latch.unlock_write();
            }
        }
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
        let mut freed = SmallVec::new();

        for entry in &mut ctx.write_set {
            match entry.kind {
                WriteKind::Update => {
                    let tuple = entry.tuple.expect("update entry without tuple");
                    let (off, len) = (entry.offset as usize, entry.size as usize);
                    tuple.raw.data.write_from(off, &entry.buf[off..off + len]);
                    tuple.raw.data.flush(off, len);
                }
                WriteKind::Insert => {
                    let raw = match self.store.alloc_tuple(entry.key.table) {
                        Some(raw) => raw,
                        None => panic!("{} capacity exhausted", entry.key.table),
                    };
                    raw.data.write_from(0, &entry.buf);
                    TplHeader::init(&raw, entry.key);
                    raw.data.flush(0, entry.buf.len());
                    raw.header.flush(0, TplHeader::SIZE as usize);
                    let tuple = TupleRef::new(entry.key.table, entry.size, raw);
                    if !self.store.insert_index(entry.key, tuple) {
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

impl ConcurrencyControl for Tpl {
    type Worker = BaseWorker;
    type Context = Ctx;

    const NAME: &'static str = "tpl";

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
        if !TplHeader::at(&tuple).latch.try_read() {
            ctx.doomed = true;
            return false;
        }
        ctx.access_read(key, 0, tuple);
        tuple.raw.data.read_into(offset as usize, dst);
        true
    }

    fn update<'c>(&self, _worker: &mut BaseWorker, ctx: &'c mut Ctx, key: Key, size: u32, offset: u32) -> Option<&'c mut [u8]> {
        let prior = ctx.find_write(key).map(|e| (e.kind, e.tuple));
        match prior {
            Some((WriteKind::Delete, _)) => return None,
            Some((WriteKind::Update, Some(tuple))) => {
                // Latch already held; just widen the staged range.
                if offset + size > tuple.size {
                    return None;
                }
                let entry = ctx.access_update(key, 0, tuple, AlignedBytes::zeroed(0), size, offset, ());
                return Some(&mut entry.buf[offset as usize..(offset + size) as usize]);
            }
            _ => {}
        }
        let tuple = self.read_index(ctx, key)?;
        if offset + size > tuple.size {
            return None;
        }
        let hdr = TplHeader::at(&tuple);
        if !hdr.latch.try_write() {
            // The blocker may be our own read latch; upgrade if we are the
            // sole reader.
            let ours = ctx.read_set.iter().rposition(|e| e.key == key);
            match ours {
                Some(pos) if hdr.latch.try_upgrade() => {
                    ctx.read_set.swap_remove(pos);
                }
                _ => {
                    ctx.doomed = true;
                    return None;
                }
            }
        }
        let mut buf = AlignedBytes::zeroed(tuple.size as usize);
        tuple.raw.data.read_into(0, &mut buf);
        let entry = ctx.access_update(key, 0, tuple, buf, size, offset, ());
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
        if ctx.find_write(key).is_some() {
            return false;
        }
        let Some(tuple) = self.read_index(ctx, key) else {
            return false;
        };
        if !TplHeader::at(&tuple).latch.try_write() {
            ctx.doomed = true;
            return false;
        }
        ctx.access_delete(key, 0, tuple, ());
        true
    }

    fn commit(&self, worker: &mut BaseWorker, ctx: &mut Ctx) -> bool {
        ctx.timings.end(Phase::Running);
        if ctx.doomed {
            return false;
        }
        ctx.timings.start(Phase::Commit);
        ctx.status = Status::Committing;

        let mut freed = SmallVec::<[TupleRef; 2]>::new();
        if ctx.has_writes() {
            ctx.commit_ts = self.clock.next();
            let page = self.write_log(worker, ctx);
            freed = self.apply(ctx);
            self.wal.release(page);
        }
        self.release_all(ctx);
        for tuple in freed {
            self.store.free_tuple(tuple.table, tuple.raw);
        }

        ctx.timings.end(Phase::Commit);
        ctx.timings.end(Phase::Total);
        ctx.status = Status::Committed;
        worker.recorder.submit(&ctx.timings);
        true
    }

    fn abort(&self, worker: &mut BaseWorker, ctx: &mut Ctx) -> bool {
        worker.recorder.abort_tx();
        self.release_all(ctx);
        if ctx.status == Status::Running {
            ctx.timings.end(Phase::Running);
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

    fn engine() -> Tpl {
        let schemas = [TableSchema {
            tuple_size: 16,
            max_tuples: 64,
        }];
        Tpl::open(
            &Options {
                log_bytes: 1 << 20,
                ..Options::default()
            },
            &schemas,
        )
        .unwrap()
    }

    #[test]
    fn conflicting_writer_is_refused_until_release() {
        let cc = engine();
        let k = Key::new(TableId(0), 1);
        let mut w0 = cc.spawn_worker(0);
        let mut w1 = cc.spawn_worker(1);

        let mut load = Executor::begin(&cc, &mut w0);
        assert!(load.insert(k, &[0u8; 16]));
        assert!(load.commit());

        let mut t1 = Executor::begin(&cc, &mut w0);
        assert!(t1.update_at(k, &[1u8; 16], 0));

        // t2 cannot latch k while t1 holds it.
        let mut t2 = Executor::begin(&cc, &mut w1);
        assert!(!t2.update_at(k, &[2u8; 16], 0));
        assert!(!t2.commit());
        t2.abort();

        assert!(t1.commit());

        let mut t3 = Executor::begin(&cc, &mut w1);
        assert!(t3.update_at(k, &[3u8; 16], 0));
        assert!(t3.commit());
    }

    #[test]
    fn read_latch_upgrades_for_sole_reader() {
        let cc = engine();
        let k = Key::new(TableId(0), 2);
        let mut w = cc.spawn_worker(0);

        let mut load = Executor::begin(&cc, &mut w);
        assert!(load.insert(k, &[7u8; 16]));
        assert!(load.commit());

        let mut tx = Executor::begin(&cc, &mut w);
        let mut buf = [0u8; 16];
        assert!(tx.read_at(k, &mut buf, 0));
        assert_eq!(buf, [7u8; 16]);
        // Same transaction writes what it read: upgrade, not deadlock.
        assert!(tx.update_at(k, &[8u8; 16], 0));
        assert!(tx.commit());

        let mut check = Executor::begin(&cc, &mut w);
        assert!(check.read_at(k, &mut buf, 0));
        assert_eq!(buf, [8u8; 16]);
        assert!(check.commit());
    }

    #[test]
    fn reader_blocks_writer_but_not_reader() {
        let cc = engine();
        let k = Key::new(TableId(0), 3);
        let mut w0 = cc.spawn_worker(0);
        let mut w1 = cc.spawn_worker(1);

        let mut load = Executor::begin(&cc, &mut w0);
        assert!(load.insert(k, &[5u8; 16]));
        assert!(load.commit());

        let mut r1 = Executor::begin(&cc, &mut w0);
        let mut buf = [0u8; 16];
        assert!(r1.read_at(k, &mut buf, 0));

        let mut r2 = Executor::begin(&cc, &mut w1);
        assert!(r2.read_at(k, &mut buf, 0));
        assert!(r2.commit());

        // A writer is refused while r1 still holds its read latch.
        let mut t = Executor::begin(&cc, &mut w1);
        assert!(t.update_slice(k, 16, 0).is_none());
        assert!(!t.commit());
        t.abort();

        assert!(r1.commit());
    }
}
