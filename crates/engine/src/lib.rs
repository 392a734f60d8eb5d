//! Concurrency-control engines over the shared pmtx runtime.
//!
//! Six interchangeable engines implement the same [`ConcurrencyControl`]
//! surface: optimistic validation ([`Occ`]), TicToc timestamp negotiation
//! ([`TicToc`]), multi-versioning with a per-tuple version ring ([`Mvcc`]),
//! two-phase locking ([`Tpl`]), and the deferred-persistence pair
//! [`Courier`] / [`CourierSave`]. Workloads drive any of them through the
//! typed [`Executor`] adapter; the transaction manager only sees the
//! booleans of `run`, `commit` and `reset`.

mod clock;
mod context;
pub mod courier;
pub mod courier_save;
mod error;
mod executor;
mod latch;
mod logio;
pub mod metrics;
pub mod mvcc;
pub mod occ;
pub mod recovery;
pub mod tictoc;
pub mod tpl;
mod tuple;

pub use crate::{
    clock::{Clock, TsRegisters},
    context::{AlignedBytes, ReadEntry, Status, TxContext, WriteEntry, WriteKind},
    courier::Courier,
    courier_save::CourierSave,
    error::Error,
    executor::{Execute, Executor},
    latch::RwLatch,
    logio::BaseWorker,
    metrics::{MetricsHub, Phase, Recorder, Summary},
    mvcc::Mvcc,
    occ::Occ,
    recovery::{RecoveredOp, RecoveredTx, RecoveryStats},
    tictoc::TicToc,
    tpl::Tpl,
    tuple::TupleRef,
};

use pmtx_pmem::Key;
use std::path::PathBuf;

/// Upper bound on concurrently registered workers. Sizes the MVCC timestamp
/// registers and caps aid recruitment.
pub const MAX_WORKERS: usize = 64;

/// Default log page size where the engine does not dictate one.
pub const DEFAULT_LOG_PAGE: usize = 48 * 1024;

/// Engine construction options shared by all variants.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Backing file of the NVM region; anonymous (volatile) when `None`.
    pub path: Option<PathBuf>,
    /// Bytes reserved for the log span. Zero picks a default.
    pub log_bytes: usize,
    /// Courier-Save only: DRAM cache budget per table per worker. Zero picks
    /// a default.
    pub cache_bytes: usize,
}

impl Options {
    pub(crate) fn log_bytes(&self) -> usize {
        if self.log_bytes == 0 {
            32 << 20
        } else {
            self.log_bytes
        }
    }

    pub(crate) fn cache_bytes(&self) -> usize {
        if self.cache_bytes == 0 {
            8 << 20
        } else {
            self.cache_bytes
        }
    }
}

/// One pluggable concurrency-control engine.
///
/// Per-transaction state lives in `Context`, per-thread state (log page
/// cursor, combining buffers, latency recorder) in `Worker`. All operations
/// report success as booleans or option-ness; the workload decides whether a
/// missing key or refused insert dooms the transaction.
pub trait ConcurrencyControl: Send + Sync + Sized {
    type Worker: Send;
    type Context: Default + Send;

    const NAME: &'static str;

    /// Per-thread state, created once per worker thread. `tid` must be dense
    /// starting at zero and below [`MAX_WORKERS`].
    fn spawn_worker(&self, tid: u32) -> Self::Worker;

    fn begin(&self, worker: &mut Self::Worker, ctx: &mut Self::Context);

    /// Copy `dst.len()` bytes of the record at `key`, starting at `offset`,
    /// into `dst`. Reads the transaction's own pending write if there is one.
    fn read_into(&self, worker: &mut Self::Worker, ctx: &mut Self::Context, key: Key, dst: &mut [u8], offset: u32)
        -> bool;

    /// Stage an update and return the `[offset, offset + size)` range of the
    /// transaction-private tuple image, pre-filled with the current value;
    /// the caller edits it in place.
    fn update<'c>(
        &self,
        worker: &mut Self::Worker,
        ctx: &'c mut Self::Context,
        key: Key,
        size: u32,
        offset: u32,
    ) -> Option<&'c mut [u8]>;

    /// Stage an insert. `false` when the key already exists.
    fn insert(&self, worker: &mut Self::Worker, ctx: &mut Self::Context, key: Key, src: &[u8]) -> bool;

    /// Stage a delete. `false` when the key does not exist.
    fn remove(&self, worker: &mut Self::Worker, ctx: &mut Self::Context, key: Key) -> bool;

    /// Validate and commit. `false` means the transaction aborted and should
    /// be retried after [`ConcurrencyControl::reset`].
    fn commit(&self, worker: &mut Self::Worker, ctx: &mut Self::Context) -> bool;

    fn abort(&self, worker: &mut Self::Worker, ctx: &mut Self::Context) -> bool;

    fn reset(&self, worker: &mut Self::Worker, ctx: &mut Self::Context) -> bool;

    /// Drain any deferred work (the Courier pipeline) and fence.
    fn flush_all(&self);

    fn metrics(&self) -> &MetricsHub;
}
