//! Two-phase crash recovery.
//!
//! Phase one walks every table's slab and rebuilds the index from headers
//! whose valid bit survived. Phase two scans each log page still marked
//! in-use, buffering update/insert records in arrival order and releasing
//! them at each commit record; an unknown tag ends the page (lazy
//! truncation of uncommitted work). The buffered transactions are then
//! re-executed through a normal executor, so post-recovery state is
//! reachable by the same code that produced it.

use std::time::Instant;

use log::info;
use pmtx_pmem::{Key, RawTuple, Store, TableId};
use pmtx_wal::{LogManager, Record};

use crate::{executor::Execute, tuple::HeaderPrefix};

#[derive(Debug, Default)]
pub struct RecoveryStats {
    /// Elapsed milliseconds of the slab iteration phase.
    pub data_ms: u64,
    /// Elapsed milliseconds of the log scan phase.
    pub log_ms: u64,
    /// Live tuples found in the slabs.
    pub tuples: usize,
    /// Log pages scanned (bitmap bit set at crash time).
    pub pages: usize,
    /// Log records decoded across those pages.
    pub records: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveredOp {
    Update { offset: u32 },
    Insert,
}

/// One committed operation lifted out of the log, replayed through the
/// executor like any workload transaction.
#[derive(Clone, Debug)]
pub struct RecoveredTx {
    pub ts: u64,
    pub key: Key,
    pub op: RecoveredOp,
    pub data: Vec<u8>,
}

impl RecoveredTx {
    pub fn run<E: Execute>(&self, exec: &mut E) -> bool {
        match self.op {
            RecoveredOp::Update { offset } => exec.update_at(self.key, &self.data, offset),
            RecoveredOp::Insert => {
                // A refused insert means the record reached the slab before
                // the crash; the log entry is already satisfied.
                exec.insert(self.key, &self.data);
                true
            }
        }
    }
}

/// Phase one: rebuild index entries (and per-engine DRAM metadata, via
/// `make`) from the slabs, re-arming the slot allocators as a side effect.
pub(crate) fn rebuild_tables<T: Copy + Send + Sync + 'static>(
    store: &Store<T>,
    stats: &mut RecoveryStats,
    mut make: impl FnMut(TableId, RawTuple) -> T,
) {
    let start = Instant::now();
    for t in 0..store.table_count() {
        let table = TableId(t as u32);
        let mut live = vec![false; store.schema(table).max_tuples as usize];
        store.scan_table(table, |idx, raw| {
            let prefix = HeaderPrefix::at(&raw.header);
            if !prefix.is_valid() {
                return;
            }
            let key = prefix.key();
            debug_assert_eq!(key.table, table);
            let entry = make(table, raw);
            store.insert_index(key, entry);
            raw.header.flush(0, HeaderPrefix::SIZE);
            live[idx as usize] = true;
            stats.tuples += 1;
        });
        store.rebuild_table(table, |idx| live[idx as usize]);
    }
    stats.data_ms = start.elapsed().as_millis() as u64;
    info!("recovery: data iteration took {} ms ({} live tuples)", stats.data_ms, stats.tuples);
}

/// Phase two: per-page sequential scan. Records become visible only through
/// a commit record that follows them in the same page.
pub(crate) fn replay_log(wal: &LogManager, stats: &mut RecoveryStats) -> Vec<RecoveredTx> {
    let start = Instant::now();
    let mut out = Vec::new();

    for (_idx, scanner) in wal.scan_used() {
        stats.pages += 1;
        let mut pending: Vec<RecoveredTx> = Vec::new();
        for record in scanner {
            stats.records += 1;
            match record {
                Record::Start { .. } => {}
                Record::Update { ts, key, offset, payload } => pending.push(RecoveredTx {
                    ts,
                    key,
                    op: RecoveredOp::Update { offset },
                    data: payload.to_vec(),
                }),
                Record::Insert { ts, key, payload } => pending.push(RecoveredTx {
                    ts,
                    key,
                    op: RecoveredOp::Insert,
                    data: payload.to_vec(),
                }),
                // Deleted records were unlinked in place; nothing to redo.
                Record::Delete { .. } => {}
                Record::Commit { .. } => out.append(&mut pending),
            }
        }
        // Anything left in `pending` never saw its commit record: the
        // transaction was in flight at the crash and is discarded.
    }

    stats.log_ms = start.elapsed().as_millis() as u64;
    info!(
        "recovery: log iteration took {} ms ({} pages, {} records, {} replayable)",
        stats.log_ms,
        stats.pages,
        stats.records,
        out.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{occ::Occ, ConcurrencyControl, Execute, Executor, Options};
    use pmtx_pmem::{TableId, TableSchema};

    fn schemas() -> [TableSchema; 1] {
        [TableSchema {
            tuple_size: 32,
            max_tuples: 64,
        }]
    }

    /// Committed state is reconstructed from slab headers alone; the log of
    /// fully-applied transactions replays as a no-op.
    #[test]
    fn occ_recovery_rebuilds_index_from_slab() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        let opts = Options {
            path: Some(path),
            log_bytes: 1 << 20,
            ..Options::default()
        };

        let k1 = Key::new(TableId(0), 1);
        let k2 = Key::new(TableId(0), 2);
        {
            let cc = Occ::open(&opts, &schemas()).unwrap();
            let mut w = cc.spawn_worker(0);
            let mut tx = Executor::begin(&cc, &mut w);
            assert!(tx.insert(k1, &[1u8; 32]));
            assert!(tx.insert(k2, &[2u8; 32]));
            assert!(tx.commit());

            let mut tx = Executor::begin(&cc, &mut w);
            assert!(tx.remove(k2));
            assert!(tx.commit());
            cc.flush_all();
        }

        let (cc, txs, stats) = Occ::recover(&opts, &schemas()).unwrap();
        // Both transactions released their pages after applying.
        assert_eq!(txs.len(), 0);
        assert_eq!(stats.tuples, 1);

        let mut w = cc.spawn_worker(0);
        let mut check = Executor::begin(&cc, &mut w);
        let mut buf = [0u8; 32];
        assert!(check.read_at(k1, &mut buf, 0));
        assert_eq!(buf, [1u8; 32]);
        assert!(!check.read_at(k2, &mut buf, 0), "deleted key must stay gone");
        assert!(check.commit());
    }

    /// Applying the same update log twice is idempotent: update records are
    /// absolute on their range.
    #[test]
    fn replaying_updates_twice_is_idempotent() {
        let cc = Occ::open(
            &Options {
                log_bytes: 1 << 20,
                ..Options::default()
            },
            &schemas(),
        )
        .unwrap();
        let k = Key::new(TableId(0), 9);
        let mut w = cc.spawn_worker(0);
        let mut tx = Executor::begin(&cc, &mut w);
        assert!(tx.insert(k, &[0u8; 32]));
        assert!(tx.commit());

        let replay = RecoveredTx {
            ts: 7,
            key: k,
            op: RecoveredOp::Update { offset: 8 },
            data: vec![5u8; 8],
        };
        for _ in 0..2 {
            let mut exec = Executor::begin(&cc, &mut w);
            assert!(replay.run(&mut exec));
            assert!(exec.commit());
        }

        let mut check = Executor::begin(&cc, &mut w);
        let mut buf = [0u8; 32];
        assert!(check.read_at(k, &mut buf, 0));
        assert_eq!(&buf[8..16], &[5u8; 8]);
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert!(check.commit());
    }
}
