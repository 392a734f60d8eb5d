use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::Mutex;

/// Instrumented phases of a transaction's life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Running = 0,
    Commit,
    Index,
    Validate,
    PersistLog,
    PersistData,
    Total,
}

pub const PHASES: usize = 7;

pub const ALL_PHASES: [Phase; PHASES] = [
    Phase::Running,
    Phase::Commit,
    Phase::Index,
    Phase::Validate,
    Phase::PersistLog,
    Phase::PersistData,
    Phase::Total,
];

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Running => "running",
            Phase::Commit => "commit",
            Phase::Index => "index",
            Phase::Validate => "validate",
            Phase::PersistLog => "persist-log",
            Phase::PersistData => "persist-data",
            Phase::Total => "total",
        }
    }
}

/// Per-transaction phase stopwatch. Cheap no-op while recording is off.
pub struct TxTimings {
    enabled: bool,
    epoch: Instant,
    begun: [u64; PHASES],
    acc: [u64; PHASES],
}

impl Default for TxTimings {
    fn default() -> Self {
        Self {
            enabled: false,
            epoch: Instant::now(),
            begun: [0; PHASES],
            acc: [0; PHASES],
        }
    }
}

impl TxTimings {
    pub fn arm(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.begun = [0; PHASES];
        self.acc = [0; PHASES];
        if enabled {
            self.epoch = Instant::now();
        }
    }

    #[inline]
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    #[inline]
    pub fn start(&mut self, phase: Phase) {
        if self.enabled {
            self.begun[phase as usize] = self.now();
        }
    }

    #[inline]
    pub fn end(&mut self, phase: Phase) {
        if self.enabled {
            let idx = phase as usize;
            self.acc[idx] += self.now() - self.begun[idx];
        }
    }

    pub fn ns(&self, phase: Phase) -> u64 {
        self.acc[phase as usize]
    }
}

/// Latency bucket width in nanoseconds.
const COMPRESS: u64 = 32;
/// Bucket count; latencies above `COMPRESS * (BUCKETS - 1)` saturate.
const BUCKETS: usize = 64 * 1024;

/// Fixed-bucket latency histogram with percentile extraction.
pub struct LatencyHistogram {
    buckets: Box<[u64]>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: vec![0; BUCKETS].into_boxed_slice(),
        }
    }

    pub fn add(&mut self, ns: u64) {
        let bucket = ((ns / COMPRESS) as usize).min(BUCKETS - 1);
        self.buckets[bucket] += 1;
    }

    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Total recorded time, bucket-quantized.
    pub fn total_ns(&self) -> u64 {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, n)| n * i as u64 * COMPRESS)
            .sum()
    }

    /// Latency below which `pct` percent of the samples fall.
    pub fn percentile(&self, pct: u8) -> u64 {
        debug_assert!(pct < 100);
        let total = self.count() as i64;
        let mut level = (total * pct as i64 + 99) / 100;
        for (i, n) in self.buckets.iter().enumerate() {
            level -= *n as i64;
            if level <= 0 {
                return (i as u64 + 1) * COMPRESS;
            }
        }
        0
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        for (dst, src) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *dst += src;
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct SummaryInner {
    hists: Option<Box<[LatencyHistogram]>>,
    started: u64,
    aborted: u64,
}

/// Aggregated metrics across all workers of one engine instance. Workers
/// combine their recorders in on exit; reading the summary while workers are
/// live sees only already-retired recorders.
#[derive(Default)]
pub struct Summary {
    inner: Mutex<SummaryInner>,
}

/// Frozen view of a [`Summary`].
pub struct MetricsReport {
    pub started: u64,
    pub aborted: u64,
    pub p99_ns: [u64; PHASES],
    pub total_ns: [u64; PHASES],
}

impl Summary {
    fn combine(&self, recorder: &mut Recorder) {
        let mut inner = self.inner.lock();
        inner.started += recorder.started;
        inner.aborted += recorder.aborted;
        match &mut inner.hists {
            Some(hists) => {
                for (dst, src) in hists.iter_mut().zip(recorder.hists.iter()) {
                    dst.merge(src);
                }
            }
            None => inner.hists = Some(std::mem::take(&mut recorder.hists)),
        }
    }

    pub fn report(&self) -> MetricsReport {
        let inner = self.inner.lock();
        let mut p99 = [0; PHASES];
        let mut total = [0; PHASES];
        if let Some(hists) = &inner.hists {
            for phase in ALL_PHASES {
                let i = phase as usize;
                p99[i] = hists[i].percentile(99);
                total[i] = hists[i].total_ns();
            }
        }
        MetricsReport {
            started: inner.started,
            aborted: inner.aborted,
            p99_ns: p99,
            total_ns: total,
        }
    }
}

/// Engine-owned metrics wiring handed to workers at spawn: the recording
/// switch and the shared summary.
#[derive(Clone, Default)]
pub struct MetricsHub {
    enabled: Arc<AtomicBool>,
    summary: Arc<Summary>,
}

impl MetricsHub {
    pub fn set_recording(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn recording(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn recorder(&self) -> Recorder {
        Recorder {
            hub: self.clone(),
            hists: (0..PHASES).map(|_| LatencyHistogram::new()).collect(),
            started: 0,
            aborted: 0,
        }
    }
}

/// Per-worker metrics recorder; folded into the hub's summary on drop.
pub struct Recorder {
    hub: MetricsHub,
    hists: Box<[LatencyHistogram]>,
    started: u64,
    aborted: u64,
}

impl Recorder {
    pub fn recording(&self) -> bool {
        self.hub.recording()
    }

    pub fn start_tx(&mut self) {
        if self.recording() {
            self.started += 1;
        }
    }

    pub fn abort_tx(&mut self) {
        if self.recording() {
            self.aborted += 1;
        }
    }

    pub fn submit(&mut self, timings: &TxTimings) {
        if !timings.enabled {
            return;
        }
        for phase in ALL_PHASES {
            let ns = timings.ns(phase);
            if ns > 0 {
                self.hists[phase as usize].add(ns);
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let summary = self.hub.summary.clone();
        summary.combine(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_of_uniform_samples() {
        let mut hist = LatencyHistogram::new();
        for i in 1..=100u64 {
            hist.add(i * COMPRESS);
        }
        assert_eq!(hist.count(), 100);
        let p99 = hist.percentile(99);
        assert!(p99 >= 99 * COMPRESS && p99 <= 101 * COMPRESS, "p99 was {p99}");
        assert_eq!(hist.percentile(0), COMPRESS);
    }

    #[test]
    fn recorder_folds_into_summary() {
        let hub = MetricsHub::default();
        hub.set_recording(true);
        {
            let mut rec = hub.recorder();
            rec.start_tx();
            rec.start_tx();
            rec.abort_tx();
            let mut t = TxTimings::default();
            t.arm(true);
            t.start(Phase::Total);
            t.end(Phase::Total);
            rec.submit(&t);
        }
        let report = hub.summary().report();
        assert_eq!(report.started, 2);
        assert_eq!(report.aborted, 1);
    }

    #[test]
    fn disabled_recording_counts_nothing() {
        let hub = MetricsHub::default();
        {
            let mut rec = hub.recorder();
            rec.start_tx();
            rec.abort_tx();
        }
        let report = hub.summary().report();
        assert_eq!(report.started, 0);
        assert_eq!(report.aborted, 0);
    }
}
