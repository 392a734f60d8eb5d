use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Barrier,
    },
    thread,
    time::{Duration, Instant},
};

use log::{error, info};
use pmtx_engine::{ConcurrencyControl, Execute, Executor, RecoveredTx};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    report::Report,
    workload::{Transaction, Workload},
};

/// Loader threads for the initialization batch.
const INIT_THREADS: usize = 8;

/// Retries granted to a load/replay transaction before giving up; load
/// conflicts are bugs, not contention.
const LOAD_RETRIES: usize = 64;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub threads: u32,
    pub duration: Duration,
    /// Optional timed warm-up with recording disabled.
    pub warmup: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            duration: Duration::from_secs(10),
            warmup: None,
        }
    }
}

/// Drives N worker threads against one engine: generate, run, commit;
/// abort-and-retry on failure; a barrier aligns the start and a flag stops
/// the workers at the deadline.
pub struct TransactionManager<'a, C, W> {
    cc: &'a C,
    workload: &'a W,
}

impl<'a, C: ConcurrencyControl, W: Workload> TransactionManager<'a, C, W> {
    pub fn new(cc: &'a C, workload: &'a W) -> Self {
        Self { cc, workload }
    }

    /// Run the workload's initialization batch, striped over a bounded
    /// loader pool. Returns the number of load transactions executed.
    pub fn init(&self) -> usize {
        let txs = self.workload.initial_load();
        let total = txs.len();
        let start = Instant::now();

        // Stripe ownership up front; each loader owns its shard.
        let mut shards: Vec<Vec<W::Txn>> = (0..INIT_THREADS).map(|_| Vec::new()).collect();
        for (i, tx) in txs.into_iter().enumerate() {
            shards[i % INIT_THREADS].push(tx);
        }

        thread::scope(|scope| {
            for (tid, shard) in shards.into_iter().enumerate() {
                let cc = self.cc;
                scope.spawn(move || {
                    let mut worker = cc.spawn_worker(tid as u32);
                    for mut tx in shard {
                        run_until_committed(cc, &mut worker, &mut tx, "initial load");
                    }
                });
            }
        });
        self.cc.flush_all();

        info!("loaded {} transactions in {} ms", total, start.elapsed().as_millis());
        total
    }

    /// Re-execute recovered transactions through the normal executor path.
    pub fn replay(&self, txs: &[RecoveredTx]) {
        let start = Instant::now();
        let mut worker = self.cc.spawn_worker(0);
        for tx in txs {
            let mut replay = ReplayTxn(tx.clone());
            run_until_committed(self.cc, &mut worker, &mut replay, "recovery replay");
        }
        drop(worker);
        self.cc.flush_all();
        info!("replayed {} transactions in {} ms", txs.len(), start.elapsed().as_millis());
    }

    /// Measured run: optional warm-up with recording off, then the timed
    /// window, then a drain of deferred work.
    pub fn run(&self, config: &ManagerConfig) -> Report {
        if let Some(warmup) = config.warmup {
            info!("warming up for {} ms", warmup.as_millis());
            self.run_phase(config.threads, warmup);
        }

        self.cc.metrics().set_recording(true);
        let wall = self.run_phase(config.threads, config.duration);
        self.cc.metrics().set_recording(false);
        self.cc.flush_all();

        Report::collect(C::NAME, config.threads, wall, self.cc.metrics().summary())
    }

    fn run_phase(&self, threads: u32, duration: Duration) -> Duration {
        // Fresh stop flag per phase; a reused flag would end the next phase
        // immediately.
        let stop = AtomicBool::new(false);
        let barrier = Barrier::new(threads as usize + 1);
        let mut wall = Duration::ZERO;

        thread::scope(|scope| {
            for tid in 0..threads {
                let cc = self.cc;
                let workload = self.workload;
                let stop = &stop;
                let barrier = &barrier;
                scope.spawn(move || worker_loop(cc, workload, tid, barrier, stop));
            }

            barrier.wait();
            let start = Instant::now();
            thread::sleep(duration);
            stop.store(true, Ordering::Relaxed);
            wall = start.elapsed();
        });
        wall
    }
}

fn worker_loop<C: ConcurrencyControl, W: Workload>(
    cc: &C,
    workload: &W,
    tid: u32,
    barrier: &Barrier,
    stop: &AtomicBool,
) {
    let mut worker = cc.spawn_worker(tid);
    let mut rng = StdRng::seed_from_u64(0x9E37_79B9_7F4A_7C15 ^ tid as u64);
    barrier.wait();

    while !stop.load(Ordering::Relaxed) {
        let mut tx = workload.generate(&mut rng);
        let mut exec = Executor::begin(cc, &mut worker);
        loop {
            if tx.run(&mut exec) && exec.commit() {
                break;
            }
            exec.abort();
            if stop.load(Ordering::Relaxed) {
                break;
            }
            exec.reset();
        }
    }
}

fn run_until_committed<C: ConcurrencyControl, T: Transaction>(
    cc: &C,
    worker: &mut C::Worker,
    tx: &mut T,
    what: &str,
) {
    let mut exec = Executor::begin(cc, worker);
    for _ in 0..LOAD_RETRIES {
        if tx.run(&mut exec) && exec.commit() {
            return;
        }
        error!("unexpected abort during {what}");
        exec.abort();
        exec.reset();
    }
    panic!("{what} transaction failed {LOAD_RETRIES} times");
}

struct ReplayTxn(RecoveredTx);

impl Transaction for ReplayTxn {
    fn run<E: pmtx_engine::Execute>(&mut self, exec: &mut E) -> bool {
        self.0.run(exec)
    }

    fn is_read_only(&self) -> bool {
        false
    }
}
