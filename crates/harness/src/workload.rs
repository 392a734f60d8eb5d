use pmtx_engine::Execute;
use pmtx_pmem::TableSchema;
use rand::rngs::StdRng;

/// One unit of work. `run` stages operations against the executor and
/// returns whether the transaction wants to commit; the manager retries the
/// same object after an abort, so `run` must be re-runnable.
pub trait Transaction: Send {
    fn run<E: Execute>(&mut self, exec: &mut E) -> bool;

    fn is_read_only(&self) -> bool;
}

/// A transaction stream plus the table schemas it runs against.
pub trait Workload: Send + Sync {
    type Txn: Transaction;

    /// `(tuple_size, max_tuple_count)` per table, in table-tag order.
    fn schemas(&self) -> Vec<TableSchema>;

    /// Transactions populating the tables before measurement; run striped
    /// over a bounded loader pool.
    fn initial_load(&self) -> Vec<Self::Txn>;

    fn generate(&self, rng: &mut StdRng) -> Self::Txn;
}
