use std::hint;

use pmtx_wal::{LogManager, LogPage, PageCursor};

use crate::{
    context::{WriteEntry, WriteKind},
    metrics::{MetricsHub, Recorder},
};

/// Per-thread state shared by the engines without deferred persistence: the
/// log-page probe cursor and the latency recorder.
pub struct BaseWorker {
    pub tid: u32,
    pub cursor: PageCursor,
    pub recorder: Recorder,
}

impl BaseWorker {
    pub(crate) fn new(hub: &MetricsHub, tid: u32) -> Self {
        Self {
            tid,
            cursor: PageCursor::from_entropy(),
            recorder: hub.recorder(),
        }
    }
}

/// Spin until a page allocation probe succeeds. Engines without a deferred
/// pipeline have nothing to aid; a bit clears as soon as some committer
/// finishes its apply phase.
pub(crate) fn alloc_page_spin(wal: &LogManager, cursor: &mut PageCursor) -> LogPage {
    loop {
        if let Some(page) = wal.try_alloc(cursor) {
            return page;
        }
        hint::spin_loop();
    }
}

/// Append one transaction's records: start, inserts, then updates and
/// deletes in write-set order, then the commit record. The caller flushes
/// and fences.
pub(crate) fn append_tx_records<H, X>(page: &mut LogPage, ts: u64, write_set: &[WriteEntry<H, X>]) {
    page.append_start(ts);
    for entry in write_set.iter().filter(|e| e.kind == WriteKind::Insert) {
        page.append_insert(ts, entry.key, &entry.buf);
    }
    for entry in write_set {
        match entry.kind {
            WriteKind::Insert => {}
            WriteKind::Update => {
                let range = &entry.buf[entry.offset as usize..(entry.offset + entry.size) as usize];
                page.append_update(ts, entry.key, entry.offset, range);
            }
            WriteKind::Delete => page.append_delete(ts, entry.key),
        }
    }
    page.append_commit(ts);
    page.seal();
}
