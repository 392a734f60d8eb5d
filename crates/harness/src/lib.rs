//! Benchmark harness for the pmtx engines: workload traits, a key-value
//! microbenchmark with Zipfian skew, and the transaction manager driving N
//! worker threads from a start barrier to a measured deadline.

mod kv;
mod manager;
mod report;
mod workload;
mod zipf;

pub use crate::{
    kv::{KvConfig, KvTxn, KvWorkload},
    manager::{ManagerConfig, TransactionManager},
    report::Report,
    workload::{Transaction, Workload},
    zipf::Zipfian,
};
