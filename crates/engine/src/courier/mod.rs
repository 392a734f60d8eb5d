//! Courier: OCC with virtual-header indirection and deferred persistence.
//!
//! The index points at DRAM-resident [`vheader::VirtualHeader`]s; committed
//! updates become visible through the virtual pointer and are queued on a
//! shared pipeline that later writes them back to NVM and flushes, off the
//! commit path. Durability holds from the moment the log flush returns: an
//! outstanding write-back lost to a crash is replayed from the log.

pub(crate) mod persist;
pub mod vheader;

use std::sync::Arc;

use crossbeam_queue::SegQueue;
use pmtx_pmem::{fence, Key, Store, StoreConfig, TableSchema};
use pmtx_wal::{LogManager, LogPage, START_LEN};
use smallvec::SmallVec;

use crate::{
    context::{key_in_writes, AlignedBytes, Status, TxContext, WriteKind},
    courier_save::cache::CacheGuard,
    logio::{append_tx_records, BaseWorker},
    metrics::{MetricsHub, Phase},
    recovery::{self, RecoveredTx, RecoveryStats},
    tuple::HeaderPrefix,
    Clock, ConcurrencyControl, Error, Options, MAX_WORKERS,
};

use persist::{Pipeline, PipelineConfig, ThreadBuffer};
pub use vheader::CourierRef;
use vheader::VirtualHeader;

/// Log page size of plain Courier.
pub const LOG_PAGE: usize = 48 * 1024;

/// Write-latch probes granted to a committer before it gives up.
const LOCK_RETRY_BUDGET: u32 = 2;

pub(crate) type Ctx = TxContext<CourierRef, Option<CacheGuard>>;

pub struct CourierWorker {
    pub(crate) base: BaseWorker,
    pub(crate) buffer: ThreadBuffer,
    pub(crate) page: Option<LogPage>,
    pub(crate) pipeline: Arc<Pipeline>,
}

impl Drop for CourierWorker {
    fn drop(&mut self) {
        // Residual combining work (and the held page) outlives the worker on
        // the shared queue; `flush_all_works` drains it.
        if !self.buffer.is_empty() || self.page.is_some() {
            let mut buffer = std::mem::take(&mut self.buffer);
            buffer.page = self.page.take();
            self.pipeline.submit(buffer);
        }
    }
}

pub struct Courier {
    store: Store<CourierRef>,
    wal: LogManager,
    pipeline: Arc<Pipeline>,
    /// Timestamps stamped into log records; one per committed transaction so
    /// a transaction's records and its commit record agree.
    log_seq: Clock,
    /// Deleted records, parked until engine drop: concurrent readers may
    /// still hold virtual-header handles, and queued write-back events may
    /// still target the NVM slot, so neither is recycled in-process.
    graveyard: SegQueue<CourierRef>,
    hub: MetricsHub,
}

impl Courier {
    pub fn open(opts: &Options, schemas: &[TableSchema]) -> Result<Self, Error> {
        let store = Store::open(&Self::store_config(opts), schemas)?;
        let wal = LogManager::create(store.log_span(), LOG_PAGE)?;
        Ok(Self::assemble(store, wal))
    }

    pub fn recover(opts: &Options, schemas: &[TableSchema]) -> Result<(Self, Vec<RecoveredTx>, RecoveryStats), Error> {
        let store = Store::open(&Self::store_config(opts), schemas)?;
        let wal = LogManager::recover(store.log_span(), LOG_PAGE)?;

        let mut stats = RecoveryStats::default();
        recovery::rebuild_tables(&store, &mut stats, |table, raw| CourierRef {
            table,
            size: raw.data.len() as u32,
            raw,
            vh: VirtualHeader::alloc(0, raw.data, table),
        });
        let txs = recovery::replay_log(&wal, &mut stats);

        Ok((Self::assemble(store, wal), txs, stats))
    }

    fn assemble(store: Store<CourierRef>, wal: LogManager) -> Self {
        store.register_teardown(|entry: &CourierRef| {
            // SAFETY: teardown runs when the store (and with it the engine)
            // is dropped; no executor can hold handles anymore.
            unsafe { entry.vh.release() }
        });
        Self {
            store,
            wal,
            pipeline: Arc::new(Pipeline::new(PipelineConfig {
                max_batch: 64,
                high_water: 48,
                acquire_once: 4,
                max_tid: MAX_WORKERS as u32 - 1,
            })),
            log_seq: Clock::new(),
            graveyard: SegQueue::new(),
            hub: MetricsHub::default(),
        }
    }

    fn store_config(opts: &Options) -> StoreConfig {
        StoreConfig {
            path: opts.path.clone(),
            log_bytes: opts.log_bytes(),
            header_size: HeaderPrefix::SIZE as u32,
            with_versions: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pipeline_depth(&self) -> usize {
        self.pipeline.depth()
    }

    fn read_index(&self, ctx: &mut Ctx, key: Key) -> Option<CourierRef> {
        ctx.timings.start(Phase::Index);
        let tuple = self.store.read_index(key);
        ctx.timings.end(Phase::Index);
        tuple
    }

    fn ensure_page(&self, worker: &mut CourierWorker) {
        while worker.page.is_none() {
            match self.wal.try_alloc(&mut worker.base.cursor) {
                Some(page) => worker.page = Some(page),
                None => self.pipeline.aid(worker.base.tid, &self.wal, self.hub.recording()),
            }
        }
    }

    /// Hand the current combining buffer (with its filled page) to the
    /// pipeline and start a fresh one.
    fn publish_buffer(&self, worker: &mut CourierWorker) {
        let mut buffer = std::mem::take(&mut worker.buffer);
        buffer.page = worker.page.take();
        self.pipeline.submit(buffer);
    }

    fn write_log(&self, worker: &mut CourierWorker, ctx: &mut Ctx) {
        ctx.timings.start(Phase::PersistLog);
        let ts = self.log_seq.next();
        let page = worker.page.as_mut().expect("commit without log page");
        let mark = page.mark();
        append_tx_records(page, ts, &ctx.write_set);
        page.flush_from(mark);
        fence();
        ctx.timings.end(Phase::PersistLog);
    }

    fn apply(&self, ctx: &mut Ctx) -> SmallVec<[CourierRef; 2]> {
        ctx.timings.start(Phase::PersistData);
        let mut deleted = SmallVec::new();

        for entry in &mut ctx.write_set {
            match entry.kind {
                WriteKind::Update => {
                    let tuple = entry.tuple.expect("update entry without tuple");
                    let (off, len) = (entry.offset as usize, entry.size as usize);
                    // Visible write first, fence, then the timestamp bump;
                    // the NVM write-back happens on the pipeline.
                    tuple.vh.write_visible(entry.offset, &entry.buf[off..off + len]);
                    fence();
                    tuple.vh.bump_wts();
                }
                WriteKind::Insert => {
                    let raw = match self.store.alloc_tuple(entry.key.table) {
                        Some(raw) => raw,
                        None => panic!("{} capacity exhausted", entry.key.table),
                    };
                    raw.data.write_from(0, &entry.buf);
                    HeaderPrefix::init(&raw.header, entry.key);
                    raw.data.flush(0, entry.buf.len());
                    raw.header.flush(0, HeaderPrefix::SIZE);
                    let vh = VirtualHeader::alloc(0, raw.data, entry.key.table);
                    let tuple = CourierRef {
                        table: entry.key.table,
                        size: entry.size,
                        raw,
                        vh,
                    };
                    if self.store.insert_index(entry.key, tuple) {
                        entry.tuple = Some(tuple);
                    } else {
                        HeaderPrefix::at(&raw.header).invalidate();
                        self.store.free_tuple(entry.key.table, raw);
                        // Never published, so no other handle can exist.
                        unsafe { vh.release() };
                    }
                }
                WriteKind::Delete => {
                    let tuple = entry.tuple.expect("delete entry without tuple");
                    tuple.prefix().invalidate();
                    tuple.raw.header.flush(0, HeaderPrefix::SIZE);
                    self.store.delete_index(entry.key);
                    deleted.push(tuple);
                }
            }
        }
        fence();
        ctx.timings.end(Phase::PersistData);
        deleted
    }

    fn read_only_commit(&self, worker: &mut CourierWorker, ctx: &mut Ctx) -> bool {
        self.pipeline.aid(worker.base.tid, &self.wal, self.hub.recording());
        ctx.timings.end(Phase::Total);
        ctx.status = Status::Committed;
        worker.base.recorder.submit(&ctx.timings);
        true
    }

    fn normal_commit(&self, worker: &mut CourierWorker, ctx: &mut Ctx) -> bool {
        ctx.timings.start(Phase::Commit);
        ctx.timings.start(Phase::Validate);
        ctx.status = Status::Validating;

        let total = START_LEN + ctx.log_record_bytes();
        if let Err(e) = self.wal.check_budget(total) {
            panic!("fatal log configuration: {e}");
        }
        self.ensure_page(worker);
        if !worker.page.as_ref().is_some_and(|p| p.fits(total)) {
            self.publish_buffer(worker);
            self.ensure_page(worker);
        }

        ctx.sort_write_set();

        let mut ok = !ctx.doomed;
        let mut locked = 0usize;

        if ok {
            let mut last: Option<Key> = None;
            'validate: for entry in &ctx.write_set {
                if entry.kind == WriteKind::Insert || last == Some(entry.key) {
                    continue;
                }
                let vh = entry.tuple.expect("write entry without tuple").vh;
                let mut tries = 0;
                while !vh.latch().try_write() {
                    tries += 1;
                    if tries >= LOCK_RETRY_BUDGET {
                        ok = false;
                        break 'validate;
                    }
                    std::hint::spin_loop();
                }
                last = Some(entry.key);
                locked += 1;
                if entry.wts != vh.wts() {
                    ok = false;
                    break;
                }
            }
        }

        if ok {
            for entry in &ctx.read_set {
                let vh = entry.tuple.vh;
                if vh.latch().is_write_locked() && !key_in_writes(&ctx.write_set, entry.key) {
                    ok = false;
                    break;
                }
                if entry.wts != vh.wts() {
                    ok = false;
                    break;
                }
            }
        }

        ctx.timings.end(Phase::Validate);
        ctx.status = Status::Committing;

        let mut deleted = SmallVec::<[CourierRef; 2]>::new();
        if ok {
            self.write_log(worker, ctx);
            deleted = self.apply(ctx);
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
            entry.tuple.expect("write entry without tuple").vh.latch().unlock_write();
            last = Some(entry.key);
            released += 1;
        }

        for tuple in deleted {
            self.graveyard.push(tuple);
        }

        if ok {
            for entry in &mut ctx.write_set {
                if entry.kind != WriteKind::Update {
                    continue;
                }
                let vh = entry.tuple.expect("update entry without tuple").vh;
                worker.buffer.absorb(vh, entry.offset, entry.size, entry.extra.take());
            }
        }

        self.pipeline.aid(worker.base.tid, &self.wal, self.hub.recording());

        ctx.timings.end(Phase::Commit);
        ctx.timings.end(Phase::Total);
        ctx.status = if ok { Status::Committed } else { Status::Aborted };
        if ok {
            worker.base.recorder.submit(&ctx.timings);
        }
        ok
    }
}

impl Drop for Courier {
    fn drop(&mut self) {
        self.pipeline.flush_all(&self.wal);
        self.pipeline.report_stats();
        while let Some(tuple) = self.graveyard.pop() {
            // SAFETY: the engine is going away; nothing dereferences handles
            // anymore.
            unsafe { tuple.vh.release() };
        }
    }
}

impl ConcurrencyControl for Courier {
    type Worker = CourierWorker;
    type Context = Ctx;

    const NAME: &'static str = "courier";

    fn spawn_worker(&self, tid: u32) -> CourierWorker {
        let mut worker = CourierWorker {
            base: BaseWorker::new(&self.hub, tid),
            buffer: ThreadBuffer::default(),
            page: None,
            pipeline: self.pipeline.clone(),
        };
        self.ensure_page(&mut worker);
        worker
    }

    fn begin(&self, worker: &mut CourierWorker, ctx: &mut Ctx) {
        self.ensure_page(worker);
        worker.base.recorder.start_tx();
        ctx.timings.arm(worker.base.recorder.recording());
        ctx.timings.start(Phase::Total);
        ctx.timings.start(Phase::Running);
        ctx.status = Status::Running;
    }

    fn read_into(&self, _worker: &mut CourierWorker, ctx: &mut Ctx, key: Key, dst: &mut [u8], offset: u32) -> bool {
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
        let wts = tuple.vh.wts();
        ctx.access_read(key, wts, tuple);
        tuple.vh.read_visible(offset, dst);
        true
    }

    fn update<'c>(&self, _worker: &mut CourierWorker, ctx: &'c mut Ctx, key: Key, size: u32, offset: u32) -> Option<&'c mut [u8]> {
        if ctx.find_write(key).is_some_and(|e| e.kind == WriteKind::Delete) {
            return None;
        }
        let tuple = self.read_index(ctx, key)?;
        if offset + size > tuple.size {
            return None;
        }
        let wts = tuple.vh.wts();
        let mut buf = AlignedBytes::zeroed(tuple.size as usize);
        tuple.vh.read_visible(0, &mut buf);
        let entry = ctx.access_update(key, wts, tuple, buf, size, offset, None);
        Some(&mut entry.buf[offset as usize..(offset + size) as usize])
    }

    fn insert(&self, _worker: &mut CourierWorker, ctx: &mut Ctx, key: Key, src: &[u8]) -> bool {
        if ctx.find_write(key).is_some() {
            return false;
        }
        if self.read_index(ctx, key).is_some() {
            return false;
        }
        ctx.access_insert(key, src, None);
        true
    }

    fn remove(&self, _worker: &mut CourierWorker, ctx: &mut Ctx, key: Key) -> bool {
        if ctx.find_write(key).is_some_and(|e| e.kind == WriteKind::Delete) {
            return false;
        }
        let Some(tuple) = self.read_index(ctx, key) else {
            return false;
        };
        let wts = tuple.vh.wts();
        ctx.access_delete(key, wts, tuple, None);
        true
    }

    fn commit(&self, worker: &mut CourierWorker, ctx: &mut Ctx) -> bool {
        ctx.timings.end(Phase::Running);
        if ctx.has_writes() {
            self.normal_commit(worker, ctx)
        } else {
            self.read_only_commit(worker, ctx)
        }
    }

    fn abort(&self, worker: &mut CourierWorker, ctx: &mut Ctx) -> bool {
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

    fn reset(&self, worker: &mut CourierWorker, ctx: &mut Ctx) -> bool {
        ctx.clear();
        self.begin(worker, ctx);
        true
    }

    fn flush_all(&self) {
        self.pipeline.flush_all(&self.wal);
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

    fn engine(log_bytes: usize) -> Courier {
        let schemas = [TableSchema {
            tuple_size: 64,
            max_tuples: 256,
        }];
        Courier::open(
            &Options {
                log_bytes,
                ..Options::default()
            },
            &schemas,
        )
        .unwrap()
    }

    #[test]
    fn update_is_visible_before_writeback_runs() {
        let cc = engine(4 << 20);
        let k = Key::new(TableId(0), 1);
        let mut w = cc.spawn_worker(0);

        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.insert(k, &[1u8; 64]));
        assert!(tx.commit());

        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.update_at(k, &[2u8; 16], 0));
        assert!(tx.commit());

        // The write is visible through the virtual pointer immediately, even
        // though the pipeline may not have written NVM back yet.
        let mut buf = [0u8; 16];
        let mut check = Executor::begin(&cc, &mut w);
        assert!(check.read_at(k, &mut buf, 0));
        assert_eq!(buf, [2u8; 16]);
        assert!(check.commit());

        // Worker exit hands the residual combining buffer to the queue.
        drop(w);
        cc.flush_all();
        assert_eq!(cc.pipeline_depth(), 0);
    }

    #[test]
    fn wts_bumps_by_one_per_update() {
        let cc = engine(4 << 20);
        let k = Key::new(TableId(0), 2);
        let mut w = cc.spawn_worker(0);

        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.insert(k, &[0u8; 64]));
        assert!(tx.commit());

        for expect in 1..=3u64 {
            let mut tx = Executor::begin(&cc, &mut w);
            assert!(tx.update_at(k, &[expect as u8; 8], 0));
            assert!(tx.commit());
            let tuple = cc.store.read_index(k).unwrap();
            assert_eq!(tuple.vh.wts(), expect);
        }
    }

    #[test]
    fn retry_budget_aborts_on_held_latch() {
        let cc = engine(4 << 20);
        let k = Key::new(TableId(0), 3);
        let mut w0 = cc.spawn_worker(0);
        let mut w1 = cc.spawn_worker(1);

        let mut tx = Executor::begin(&cc, &mut w0);
        assert!(tx.insert(k, &[0u8; 64]));
        assert!(tx.commit());

        // Hold the write latch as a stand-in for a slow committer.
        let vh = cc.store.read_index(k).unwrap().vh;
        vh.latch().write();
        let _unlock = scopeguard::guard((), |_| vh.latch().unlock_write());

        let mut loser = Executor::begin(&cc, &mut w1);
        assert!(loser.update_at(k, &[9u8; 8], 0));
        assert!(!loser.commit());
        loser.abort();
    }

    /// A handful of pages cycle through commit -> publish -> aid -> release
    /// without stalling, even though the whole run needs far more page-fills
    /// than there are pages.
    #[test]
    fn log_pages_recycle_through_aid() {
        // 3 pages of 48K.
        let cc = engine(pmtx_pmem::CACHE_LINE + 3 * LOG_PAGE);
        assert_eq!(cc.wal.page_count(), 3);
        let k = Key::new(TableId(0), 4);
        let mut w = cc.spawn_worker(0);

        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.insert(k, &[0u8; 64]));
        assert!(tx.commit());

        // Each commit logs ~100 bytes; run enough to fill many pages over.
        for i in 0..4096u32 {
            let mut tx = Executor::begin(&cc, &mut w);
            assert!(tx.update_at(k, &i.to_le_bytes(), 0));
            assert!(tx.commit());
        }
        cc.flush_all();
        assert_eq!(cc.pipeline_depth(), 0);

        let mut buf = [0u8; 4];
        let mut check = Executor::begin(&cc, &mut w);
        assert!(check.read_at(k, &mut buf, 0));
        assert_eq!(u32::from_le_bytes(buf), 4095);
        assert!(check.commit());
    }
}
