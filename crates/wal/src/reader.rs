use std::slice;

use crate::{pages::LogManager, record::Record};

/// Sequential record scan of one page.
///
/// Yields records from the page start until a zero/unknown tag or a record
/// announcing more bytes than remain; both mean the rest of the page was
/// never written (or only partially written) and is to be ignored.
pub struct PageScanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PageScanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for PageScanner<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        let (rec, len) = Record::decode(&self.buf[self.pos..])?;
        self.pos += len;
        Some(rec)
    }
}

impl LogManager {
    /// Iterate the pages whose bitmap bit is set, yielding `(page index,
    /// record scanner)` pairs.
    ///
    /// Recovery-only: the caller must be the sole accessor of the log span
    /// while scanning.
    pub fn scan_used(&self) -> impl Iterator<Item = (u32, PageScanner<'_>)> + '_ {
        (0..self.page_count() as u32).filter_map(move |idx| {
            if !self.page_in_use(idx) {
                return None;
            }
            let span = self.page_span(idx);
            // SAFETY: single-threaded recovery context, see above; the span
            // stays mapped for the lifetime of `self`.
            let buf = unsafe { slice::from_raw_parts(span.as_ptr(), span.len()) };
            Some((idx, PageScanner::new(buf)))
        })
    }
}

#[cfg(test)]
mod tests {
    use pmtx_pmem::{Key, Region, TableId, CACHE_LINE};

    use super::*;
    use crate::pages::PageCursor;

    const PAGE: usize = 2048;

    #[test]
    fn scan_stops_at_unwritten_tail() {
        let region = Region::anonymous(CACHE_LINE + 2 * PAGE).unwrap();
        let wal = LogManager::create(region.span(), PAGE).unwrap();
        let mut cursor = PageCursor::seeded(0);
        let mut page = wal.try_alloc(&mut cursor).unwrap();

        let key = Key::new(TableId(1), 5);
        page.append_start(3);
        page.append_insert(3, key, &[9u8; 32]);
        page.append_commit(3);
        page.flush_from(0);

        // The page stays allocated, so exactly one page is scanned.
        let mut pages = 0;
        for (_, scanner) in wal.scan_used() {
            pages += 1;
            let records: Vec<_> = scanner.collect();
            assert_eq!(records.len(), 3);
            assert!(matches!(records[0], Record::Start { ts: 3 }));
            assert!(matches!(records[1], Record::Insert { ts: 3, .. }));
            assert!(matches!(records[2], Record::Commit { ts: 3 }));
        }
        assert_eq!(pages, 1);
    }

    #[test]
    fn sealed_tail_hides_stale_records_of_previous_owner() {
        let region = Region::anonymous(CACHE_LINE + PAGE).unwrap();
        let wal = LogManager::create(region.span(), PAGE).unwrap();
        let mut cursor = PageCursor::seeded(0);
        let key = Key::new(TableId(0), 1);

        // First owner fills the page with several committed transactions.
        let mut page = wal.try_alloc(&mut cursor).unwrap();
        for ts in 1..=4 {
            page.append_update(ts, key, 0, &[ts as u8; 64]);
            page.append_commit(ts);
        }
        page.seal();
        wal.release(page);

        // Second owner writes one shorter transaction into the same page.
        let mut page = wal.try_alloc(&mut cursor).unwrap();
        page.append_update(9, key, 0, &[9u8; 16]);
        page.append_commit(9);
        page.seal();

        let (_, scanner) = wal.scan_used().next().unwrap();
        let records: Vec<_> = scanner.collect();
        assert_eq!(records.len(), 2, "stale tail must be truncated");
        assert!(matches!(records[0], Record::Update { ts: 9, .. }));
        assert!(matches!(records[1], Record::Commit { ts: 9 }));
    }

    #[test]
    fn released_pages_are_not_scanned() {
        let region = Region::anonymous(CACHE_LINE + PAGE).unwrap();
        let wal = LogManager::create(region.span(), PAGE).unwrap();
        let mut cursor = PageCursor::seeded(0);
        let mut page = wal.try_alloc(&mut cursor).unwrap();
        page.append_commit(1);
        wal.release(page);

        assert_eq!(wal.scan_used().count(), 0);
    }
}
