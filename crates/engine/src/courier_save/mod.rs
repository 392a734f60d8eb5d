//! Courier-Save: Courier with per-worker DRAM cache tuples.
//!
//! The first update of a record links a slot from a ring-allocated DRAM
//! cache in front of its virtual header; subsequent updates land in the
//! cache slot, keeping the NVM write-back off the critical path entirely.
//! The deferred-persist worker copies the slot to NVM, and once no commit
//! holds a reference anymore, dissolves the link and recycles the slot.

pub mod cache;

use std::sync::{Arc, OnceLock};

use crossbeam_queue::SegQueue;
use pmtx_pmem::{fence, Key, Store, StoreConfig, TableSchema};
use pmtx_wal::{LogManager, START_LEN};
use smallvec::SmallVec;

use crate::{
    context::{key_in_writes, AlignedBytes, Status, WriteKind},
    courier::{
        persist::{Pipeline, PipelineConfig, ThreadBuffer},
        vheader::{CourierRef, VirtualHeader},
        CourierWorker, Ctx,
    },
    logio::{append_tx_records, BaseWorker},
    metrics::{MetricsHub, Phase},
    recovery::{self, RecoveredTx, RecoveryStats},
    tuple::HeaderPrefix,
    Clock, ConcurrencyControl, Error, Options, MAX_WORKERS,
};

use cache::{CacheRing, CacheSlot};

/// Log page size of Courier-Save: 32 OS pages.
pub const LOG_PAGE: usize = 32 * 4096;

const LOCK_RETRY_BUDGET: u32 = 2;

pub struct CourierSave {
    store: Store<CourierRef>,
    wal: LogManager,
    pipeline: Arc<Pipeline>,
    log_seq: Clock,
    /// Deleted records, parked until engine drop (see the plain Courier
    /// graveyard).
    graveyard: SegQueue<CourierRef>,
    schemas: Vec<TableSchema>,
    /// One cache ring per worker slot, built on first spawn. Rings live here
    /// (not in the worker) because queued events reference their slots.
    caches: Box<[OnceLock<CacheRing>]>,
    cache_bytes: usize,
    hub: MetricsHub,
}

impl CourierSave {
    pub fn open(opts: &Options, schemas: &[TableSchema]) -> Result<Self, Error> {
        let store = Store::open(&Self::store_config(opts), schemas)?;
        let wal = LogManager::create(store.log_span(), LOG_PAGE)?;
        Ok(Self::assemble(store, wal, schemas, opts.cache_bytes()))
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

        Ok((Self::assemble(store, wal, schemas, opts.cache_bytes()), txs, stats))
    }

    fn assemble(store: Store<CourierRef>, wal: LogManager, schemas: &[TableSchema], cache_bytes: usize) -> Self {
        store.register_teardown(|entry: &CourierRef| {
            // SAFETY: teardown runs at store drop; no executor holds handles.
            unsafe { entry.vh.release() }
        });
        Self {
            store,
            wal,
            pipeline: Arc::new(Pipeline::new(PipelineConfig {
                max_batch: 32,
                high_water: 24,
                acquire_once: 1,
                max_tid: MAX_WORKERS as u32 - 1,
            })),
            log_seq: Clock::new(),
            graveyard: SegQueue::new(),
            schemas: schemas.to_vec(),
            caches: (0..MAX_WORKERS).map(|_| OnceLock::new()).collect(),
            cache_bytes,
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

    fn cache_of(&self, tid: u32) -> &CacheRing {
        self.caches[tid as usize].get_or_init(|| CacheRing::new(&self.schemas, self.cache_bytes))
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

    fn apply(&self, worker: &CourierWorker, ctx: &mut Ctx) -> SmallVec<[CourierRef; 2]> {
        ctx.timings.start(Phase::PersistData);
        let cache = self.cache_of(worker.base.tid);
        let mut deleted = SmallVec::new();

        for entry in &mut ctx.write_set {
            match entry.kind {
                WriteKind::Update => {
                    let tuple = entry.tuple.expect("update entry without tuple");
                    let vh = tuple.vh;

                    // Route the write into a cache slot when possible: link a
                    // fresh slot on first update, or join the existing one.
                    // The guard keeps the slot alive until the write-back
                    // worker has copied it out.
                    let guard = if vh.visible_ptr() == vh.origin().as_ptr() {
                        cache.try_alloc(tuple.table).map(|(data, slot)| {
                            data.write_from(0, &entry.buf);
                            slot.link(vh, data)
                        })
                    } else {
                        let token = vh.cache_token();
                        // SAFETY: tokens are set under the write latch we
                        // hold and rings live as long as the engine.
                        (token != 0).then(|| unsafe { CacheSlot::from_token(token) }.acquire())
                    };

                    let (off, len) = (entry.offset as usize, entry.size as usize);
                    vh.write_visible(entry.offset, &entry.buf[off..off + len]);
                    fence();
                    vh.bump_wts();
                    entry.extra = guard;
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
            deleted = self.apply(worker, ctx);
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

impl Drop for CourierSave {
    fn drop(&mut self) {
        self.pipeline.flush_all(&self.wal);
        self.pipeline.report_stats();
        while let Some(tuple) = self.graveyard.pop() {
            // SAFETY: engine teardown; no handle is dereferenced afterwards.
            unsafe { tuple.vh.release() };
        }
    }
}

impl ConcurrencyControl for CourierSave {
    type Worker = CourierWorker;
    type Context = Ctx;

    const NAME: &'static str = "courier-save";

    fn spawn_worker(&self, tid: u32) -> CourierWorker {
        self.cache_of(tid);
        CourierWorker {
            base: BaseWorker::new(&self.hub, tid),
            buffer: ThreadBuffer::default(),
            page: None,
            pipeline: self.pipeline.clone(),
        }
    }

    fn begin(&self, worker: &mut CourierWorker, ctx: &mut Ctx) {
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

    fn opts(log_bytes: usize) -> Options {
        Options {
            log_bytes,
            cache_bytes: 1 << 16,
            ..Options::default()
        }
    }

    fn schemas() -> [TableSchema; 1] {
        [TableSchema {
            tuple_size: 64,
            max_tuples: 128,
        }]
    }

    #[test]
    fn first_update_links_cache_and_writeback_dissolves() {
        let cc = CourierSave::open(&opts(4 << 20), &schemas()).unwrap();
        let k = Key::new(TableId(0), 1);
        let mut w = cc.spawn_worker(0);

        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.insert(k, &[1u8; 64]));
        assert!(tx.commit());

        let tuple = cc.store.read_index(k).unwrap();
        assert_eq!(tuple.vh.visible_ptr(), tuple.vh.origin().as_ptr());

        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.update_at(k, &[2u8; 16], 0));
        assert!(tx.commit());

        // The update went to a cache slot; NVM still holds the old bytes.
        assert_ne!(tuple.vh.visible_ptr(), tuple.vh.origin().as_ptr());
        let mut nvm = [0u8; 16];
        tuple.vh.origin().read_into(0, &mut nvm);
        assert_eq!(nvm, [1u8; 16]);

        // Readers see the cached value.
        let mut buf = [0u8; 16];
        let mut check = Executor::begin(&cc, &mut w);
        assert!(check.read_at(k, &mut buf, 0));
        assert_eq!(buf, [2u8; 16]);
        assert!(check.commit());

        // Worker exit submits the combining buffer; write-back copies to NVM
        // and dissolves the link.
        drop(w);
        cc.flush_all();
        tuple.vh.origin().read_into(0, &mut nvm);
        assert_eq!(nvm, [2u8; 16]);
        assert_eq!(tuple.vh.visible_ptr(), tuple.vh.origin().as_ptr());
        assert_eq!(cc.pipeline_depth(), 0);
    }

    #[test]
    fn repeated_updates_share_one_cache_slot() {
        let cc = CourierSave::open(&opts(4 << 20), &schemas()).unwrap();
        let k = Key::new(TableId(0), 2);
        let mut w = cc.spawn_worker(0);

        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.insert(k, &[0u8; 64]));
        assert!(tx.commit());

        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.update_at(k, &[1u8; 8], 0));
        assert!(tx.commit());
        let tuple = cc.store.read_index(k).unwrap();
        let slot_ptr = tuple.vh.visible_ptr();
        assert_ne!(slot_ptr, tuple.vh.origin().as_ptr());

        // Second update of a cached record joins the same slot.
        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.update_at(k, &[2u8; 8], 32));
        assert!(tx.commit());
        assert_eq!(tuple.vh.visible_ptr(), slot_ptr);

        drop(w);
        cc.flush_all();
        let mut nvm = [0u8; 64];
        tuple.vh.origin().read_into(0, &mut nvm);
        assert_eq!(&nvm[..8], &[1u8; 8]);
        assert_eq!(&nvm[32..40], &[2u8; 8]);
    }

    #[test]
    fn crash_before_writeback_recovers_from_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        let opts = Options {
            path: Some(path.clone()),
            log_bytes: 1 << 20,
            cache_bytes: 1 << 16,
        };
        let k = Key::new(TableId(0), 3);

        {
            let cc = CourierSave::open(&opts, &schemas()).unwrap();
            let mut w = cc.spawn_worker(0);

            let mut tx = Executor::begin(&cc, &mut w);
            assert!(tx.insert(k, &[7u8; 64]));
            assert!(tx.commit());
            cc.flush_all();

            // The update lands in DRAM cache and in the log only.
            let mut tx = Executor::begin(&cc, &mut w);
            assert!(tx.update_at(k, &[9u8; 16], 0));
            assert!(tx.commit());

            let tuple = cc.store.read_index(k).unwrap();
            let mut nvm = [0u8; 16];
            tuple.vh.origin().read_into(0, &mut nvm);
            assert_eq!(nvm, [7u8; 16], "NVM must still hold the pre-image");

            // Power loss: the DRAM cache and pipeline vanish, the region
            // file and the held log page stay.
            std::mem::forget(w);
            std::mem::forget(cc);
        }

        let (cc, txs, _stats) = CourierSave::recover(&opts, &schemas()).unwrap();
        // Insert and update both sit in the crashed worker's log page; the
        // insert replays as a no-op against the rebuilt index.
        assert_eq!(txs.len(), 2);

        let mut w = cc.spawn_worker(0);
        for tx in &txs {
            let mut exec = Executor::begin(&cc, &mut w);
            assert!(tx.run(&mut exec));
            assert!(exec.commit());
        }

        let mut buf = [0u8; 64];
        let mut check = Executor::begin(&cc, &mut w);
        assert!(check.read_at(k, &mut buf, 0));
        assert_eq!(&buf[..16], &[9u8; 16]);
        assert_eq!(&buf[16..], &[7u8; 48]);
        assert!(check.commit());
    }
}
