use itertools::Itertools;
use pmtx_engine::Execute;
use pmtx_pmem::{Key, TableId, TableSchema};
use rand::{rngs::StdRng, Rng};
use smallvec::SmallVec;

use crate::{
    workload::{Transaction, Workload},
    zipf::Zipfian,
};

/// Rows per initial-load transaction.
const LOAD_BATCH: u64 = 64;

/// Key-value microbenchmark: fixed-size rows in one table, transactions mix
/// point reads and read-modify-write increments over a Zipfian key space.
///
/// Row layout: a little-endian `u64` counter in the first eight bytes
/// (seeded with the row id), the rest filled with the row id's low byte.
/// Both are checked by the consistency scan after a run.
#[derive(Clone, Debug)]
pub struct KvConfig {
    pub rows: u64,
    pub tuple_size: u32,
    pub ops_per_tx: usize,
    /// Percentage of operations that are reads; the rest are increments.
    pub read_pct: u8,
    /// Zipfian skew; 0 is uniform.
    pub theta: f64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            rows: 10_000,
            tuple_size: 64,
            ops_per_tx: 4,
            read_pct: 50,
            theta: 0.8,
        }
    }
}

pub struct KvWorkload {
    cfg: KvConfig,
    zipf: Zipfian,
}

impl KvWorkload {
    pub fn new(cfg: KvConfig) -> Self {
        assert!(cfg.tuple_size >= 8);
        let zipf = Zipfian::new(cfg.rows, cfg.theta);
        Self { cfg, zipf }
    }

    pub fn config(&self) -> &KvConfig {
        &self.cfg
    }

    pub fn row_bytes(&self, row: u64) -> Vec<u8> {
        let mut bytes = vec![row as u8; self.cfg.tuple_size as usize];
        bytes[..8].copy_from_slice(&row.to_le_bytes());
        bytes
    }

    /// Post-run consistency check: counters only ever grow, filler bytes
    /// never change. Returns the summed counter delta (the number of
    /// committed increments).
    pub fn verify<E: Execute>(&self, exec: &mut E) -> u64 {
        let mut delta = 0;
        let mut buf = vec![0u8; self.cfg.tuple_size as usize];
        for row in 0..self.cfg.rows {
            assert!(
                exec.read_at(Key::new(TableId(0), row), &mut buf, 0),
                "row {row} missing after run"
            );
            let counter = u64::from_le_bytes(buf[..8].try_into().unwrap());
            assert!(counter >= row, "row {row} counter went backwards");
            delta += counter - row;
            assert!(
                buf[8..].iter().all(|b| *b == row as u8),
                "row {row} filler bytes corrupted"
            );
        }
        delta
    }
}

#[derive(Clone, Copy, Debug)]
enum KvOp {
    Read(u64),
    Increment(u64),
}

pub struct KvTxn {
    ops: SmallVec<[KvOp; 8]>,
    load: Option<Vec<(u64, Vec<u8>)>>,
}

impl Transaction for KvTxn {
    fn run<E: Execute>(&mut self, exec: &mut E) -> bool {
        if let Some(batch) = &self.load {
            for (row, bytes) in batch {
                if !exec.insert(Key::new(TableId(0), *row), bytes) {
                    return false;
                }
            }
            return true;
        }
        for op in &self.ops {
            match *op {
                KvOp::Read(row) => {
                    let Some(counter) = exec.read::<u64>(Key::new(TableId(0), row)) else {
                        return false;
                    };
                    // Sanity only; the counter is seeded with the row id.
                    if *counter < row {
                        return false;
                    }
                }
                KvOp::Increment(row) => {
                    let Some(counter) = exec.update::<u64>(Key::new(TableId(0), row)) else {
                        return false;
                    };
                    *counter += 1;
                }
            }
        }
        true
    }

    fn is_read_only(&self) -> bool {
        self.load.is_none() && self.ops.iter().all(|op| matches!(op, KvOp::Read(_)))
    }
}

impl Workload for KvWorkload {
    type Txn = KvTxn;

    fn schemas(&self) -> Vec<TableSchema> {
        vec![TableSchema {
            tuple_size: self.cfg.tuple_size,
            // Headroom for insert/delete exercises on top of the base rows.
            max_tuples: (self.cfg.rows + self.cfg.rows / 8 + 16) as u32,
        }]
    }

    fn initial_load(&self) -> Vec<KvTxn> {
        (0..self.cfg.rows)
            .chunks(LOAD_BATCH as usize)
            .into_iter()
            .map(|rows| KvTxn {
                ops: SmallVec::new(),
                load: Some(rows.map(|r| (r, self.row_bytes(r))).collect()),
            })
            .collect()
    }

    fn generate(&self, rng: &mut StdRng) -> KvTxn {
        let ops = (0..self.cfg.ops_per_tx)
            .map(|_| {
                let row = self.zipf.sample(rng);
                if rng.gen_range(0..100) < self.cfg.read_pct {
                    KvOp::Read(row)
                } else {
                    KvOp::Increment(row)
                }
            })
            .collect();
        KvTxn { ops, load: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn load_covers_every_row_once() {
        let workload = KvWorkload::new(KvConfig {
            rows: 150,
            ..KvConfig::default()
        });
        let txs = workload.initial_load();
        assert_eq!(txs.len(), 3);
        let mut seen = vec![false; 150];
        for tx in &txs {
            for (row, bytes) in tx.load.as_ref().unwrap() {
                assert!(!seen[*row as usize]);
                seen[*row as usize] = true;
                assert_eq!(bytes.len(), 64);
                assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), *row);
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn generated_transactions_respect_mix() {
        let workload = KvWorkload::new(KvConfig {
            rows: 100,
            read_pct: 100,
            ..KvConfig::default()
        });
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            assert!(workload.generate(&mut rng).is_read_only());
        }
    }
}
