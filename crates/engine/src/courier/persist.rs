use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use log::info;
use pmtx_pmem::fence;
use pmtx_wal::{LogManager, LogPage};

use crate::courier::vheader::VhRef;
use crate::courier_save::cache::CacheGuard;

/// Deferred NVM write-back of one tuple: copy `[start, end)` from the
/// visible location to the NVM payload and flush it. Repeated commits
/// against the same header collapse into one event covering the union of
/// their ranges.
pub(crate) struct DelayUpdateEvent {
    pub vh: VhRef,
    pub start: u32,
    pub end: u32,
    pub guard: Option<CacheGuard>,
}

/// Per-worker combining buffer: the dedup map keyed by virtual-header
/// identity, plus the log page whose records the mapped events cover. The
/// page travels with the buffer and is released only after every event is
/// durable at its target address.
#[derive(Default)]
pub(crate) struct ThreadBuffer {
    pub events: HashMap<usize, DelayUpdateEvent>,
    pub page: Option<LogPage>,
}

impl ThreadBuffer {
    pub fn absorb(&mut self, vh: VhRef, offset: u32, size: u32, guard: Option<CacheGuard>) {
        match self.events.entry(vh.ident()) {
            Entry::Occupied(mut occupied) => {
                let event = occupied.get_mut();
                event.start = event.start.min(offset);
                event.end = event.end.max(offset + size);
                // One outstanding reference per slot is enough; the extra
                // guard of the newer commit drops here.
                drop(guard);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DelayUpdateEvent {
                    vh,
                    start: offset,
                    end: offset + size,
                    guard,
                });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.page.is_none()
    }
}

pub(crate) struct PipelineConfig {
    /// Presumed per-aider batch share when sizing the recruitment bands.
    pub max_batch: u32,
    /// Queue depth above `max_aid_tid * max_batch + high_water` recruits one
    /// more aider.
    pub high_water: u32,
    /// Buffers drained per aid call.
    pub acquire_once: u32,
    /// Highest recruitable tid.
    pub max_tid: u32,
}

/// Shared deferred-persist pipeline: an MPMC queue of combining buffers and
/// the adaptive aid controller driven by worker 0.
pub(crate) struct Pipeline {
    queue: SegQueue<ThreadBuffer>,
    max_aid_tid: AtomicU32,
    hist_max_tid: AtomicU32,
    hist_max_depth: AtomicUsize,
    cfg: PipelineConfig,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self {
            queue: SegQueue::new(),
            max_aid_tid: AtomicU32::new(0),
            hist_max_tid: AtomicU32::new(0),
            hist_max_depth: AtomicUsize::new(0),
            cfg,
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn max_aid_tid(&self) -> u32 {
        self.max_aid_tid.load(Ordering::Relaxed)
    }

    pub fn submit(&self, buffer: ThreadBuffer) {
        self.queue.push(buffer);
    }

    /// A committer's voluntary participation: worker 0 additionally runs the
    /// recruitment controller; recruited workers drain a batch.
    pub fn aid(&self, tid: u32, wal: &LogManager, recording: bool) {
        if tid == 0 {
            self.control(recording);
        }
        if tid <= self.max_aid_tid.load(Ordering::Relaxed) {
            self.drain_batch(wal);
        }
    }

    /// Sample the queue depth and move the recruitment ceiling one step.
    /// Relaxed visibility is fine: a stale ceiling merely under- or
    /// over-provisions aid for a moment.
    fn control(&self, recording: bool) {
        let ceiling = self.max_aid_tid.load(Ordering::Relaxed);
        let depth = self.queue.len();
        let low = (ceiling * self.cfg.max_batch) as usize;
        let high = low + self.cfg.high_water as usize;

        if recording {
            self.hist_max_depth.fetch_max(depth, Ordering::Relaxed);
        }

        if depth > high {
            let raised = (ceiling + 1).min(self.cfg.max_tid);
            self.max_aid_tid.store(raised, Ordering::Relaxed);
            if recording {
                self.hist_max_tid.fetch_max(raised, Ordering::Relaxed);
            }
        } else if depth < low {
            self.max_aid_tid.store(ceiling.saturating_sub(1), Ordering::Relaxed);
        }
    }

    pub fn drain_batch(&self, wal: &LogManager) {
        for _ in 0..self.cfg.acquire_once {
            match self.queue.pop() {
                Some(buffer) => self.process(buffer, wal),
                None => break,
            }
        }
    }

    /// Finish all queued work; called at shutdown and by tests.
    pub fn flush_all(&self, wal: &LogManager) {
        while let Some(buffer) = self.queue.pop() {
            self.process(buffer, wal);
        }
    }

    fn process(&self, mut buffer: ThreadBuffer, wal: &LogManager) {
        for (_, event) in buffer.events.drain() {
            Self::process_event(event);
        }
        // The log page may only be reclaimed once every payload it describes
        // is durable at its home address.
        fence();
        if let Some(page) = buffer.page.take() {
            wal.release(page);
        }
    }

    fn process_event(event: DelayUpdateEvent) {
        let vh = event.vh;
        let origin = vh.origin();
        let len = (event.end - event.start) as usize;
        let visible = vh.visible_ptr();

        if visible != origin.as_ptr() {
            let mut scratch = vec![0u8; len];
            vh.read_visible(event.start, &mut scratch);
            origin.write_from(event.start as usize, &scratch);
        }
        origin.flush(event.start as usize, len);

        if let Some(guard) = event.guard {
            let slot = guard.release();
            slot.try_dissolve(vh);
        }
    }

    pub fn report_stats(&self) {
        info!(
            "deferred persist: max recruited tid {}, max queue depth {}",
            self.hist_max_tid.load(Ordering::Relaxed),
            self.hist_max_depth.load(Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmtx_pmem::{Region, CACHE_LINE};

    fn wal_fixture() -> (Region, usize) {
        (Region::anonymous(CACHE_LINE + 4 * 1024).unwrap(), 1024)
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig {
            max_batch: 64,
            high_water: 48,
            acquire_once: 4,
            max_tid: 8,
        })
    }

    #[test]
    fn controller_recruits_under_backlog_and_stands_down() {
        let (region, page) = wal_fixture();
        let wal = LogManager::create(region.span(), page).unwrap();
        let pl = pipeline();

        // Backlog far above the high-water mark: each control step may raise
        // the ceiling by one; it must never decrease while the backlog holds.
        for _ in 0..300 {
            pl.submit(ThreadBuffer::default());
        }
        let mut prev = 0;
        for _ in 0..200 {
            pl.control(true);
            let cur = pl.max_aid_tid();
            assert!(cur >= prev, "ceiling must be monotone under backlog");
            assert!(cur <= 8, "ceiling bounded by max tid");
            prev = cur;
        }
        assert!(prev > 0);

        pl.flush_all(&wal);
        assert_eq!(pl.depth(), 0);

        // Idle queue drains the recruitment back to zero, saturating there.
        for _ in 0..20 {
            pl.control(false);
        }
        assert_eq!(pl.max_aid_tid(), 0);
        pl.control(false);
        assert_eq!(pl.max_aid_tid(), 0, "ceiling saturates at zero");
    }

    #[test]
    fn aid_drains_and_releases_pages() {
        let (region, page_size) = wal_fixture();
        let wal = LogManager::create(region.span(), page_size).unwrap();
        let pl = pipeline();

        let mut cursor = pmtx_wal::PageCursor::seeded(0);
        let page = wal.try_alloc(&mut cursor).unwrap();
        let idx = page.idx();
        let buffer = ThreadBuffer {
            events: HashMap::new(),
            page: Some(page),
        };
        pl.submit(buffer);
        assert!(wal.page_in_use(idx));

        // tid 0 always aids.
        pl.aid(0, &wal, false);
        assert_eq!(pl.depth(), 0);
        assert!(!wal.page_in_use(idx));
    }

    #[test]
    fn absorb_unions_ranges_per_header() {
        let region = Region::anonymous(4096).unwrap();
        let origin = region.span().slice(0, 64);
        let vh = crate::courier::vheader::VirtualHeader::alloc(0, origin, pmtx_pmem::TableId(0));

        let mut buffer = ThreadBuffer::default();
        buffer.absorb(vh, 8, 8, None);
        buffer.absorb(vh, 32, 16, None);
        assert_eq!(buffer.events.len(), 1);
        let event = buffer.events.values().next().unwrap();
        assert_eq!((event.start, event.end), (8, 48));

        unsafe { vh.release() };
    }
}
