//! Benchmark driver. Configuration is compile-time, like the rest of the
//! testbed: pick the engine, thread counts and workload below and rebuild.

use std::time::Duration;

use log::info;
use pmtx_engine::{ConcurrencyControl, Courier, CourierSave, Mvcc, Occ, Options, TicToc, Tpl};
use pmtx_harness::{KvConfig, KvWorkload, ManagerConfig, TransactionManager, Workload};

#[derive(Clone, Copy, Debug)]
enum EngineKind {
    Occ,
    TicToc,
    Mvcc,
    Tpl,
    Courier,
    CourierSave,
}

/// Engine under test.
const ENGINE: EngineKind = EngineKind::Courier;
/// Worker-thread counts to sweep.
const THREAD_COUNTS: &[u32] = &[1, 2, 4, 8];
/// Measured window per thread count.
const RUN_MILLIS: u64 = 10_000;
/// Warm-up window, zero to skip.
const WARMUP_MILLIS: u64 = 3_000;

fn workload() -> KvWorkload {
    KvWorkload::new(KvConfig {
        rows: 100_000,
        tuple_size: 64,
        ops_per_tx: 4,
        read_pct: 50,
        theta: 0.8,
    })
}

fn options() -> Options {
    Options {
        path: None,
        log_bytes: 256 << 20,
        cache_bytes: 0,
    }
}

fn bench<C, F>(open: F)
where
    C: ConcurrencyControl,
    F: Fn() -> C,
{
    let workload = workload();
    for &threads in THREAD_COUNTS {
        let cc = open();
        let manager = TransactionManager::new(&cc, &workload);

        info!("starting initialization");
        manager.init();

        info!("starting measured run with {threads} threads");
        let report = manager.run(&ManagerConfig {
            threads,
            duration: Duration::from_millis(RUN_MILLIS),
            warmup: (WARMUP_MILLIS > 0).then(|| Duration::from_millis(WARMUP_MILLIS)),
        });
        println!("{report}");
    }
}

fn main() {
    env_logger::init();

    let opts = options();
    let schemas = workload().schemas();
    match ENGINE {
        EngineKind::Occ => bench(|| Occ::open(&opts, &schemas).expect("open occ")),
        EngineKind::TicToc => bench(|| TicToc::open(&opts, &schemas).expect("open tictoc")),
        EngineKind::Mvcc => bench(|| Mvcc::open(&opts, &schemas).expect("open mvcc")),
        EngineKind::Tpl => bench(|| Tpl::open(&opts, &schemas).expect("open tpl")),
        EngineKind::Courier => bench(|| Courier::open(&opts, &schemas).expect("open courier")),
        EngineKind::CourierSave => bench(|| CourierSave::open(&opts, &schemas).expect("open courier-save")),
    }
}
