use std::{fmt, time::Duration};

use pmtx_engine::metrics::{Summary, ALL_PHASES, PHASES};

/// Summary of one measured run.
pub struct Report {
    pub engine: &'static str,
    pub threads: u32,
    pub wall: Duration,
    /// Transaction attempts, including retries of aborted transactions.
    pub attempts: u64,
    pub aborts: u64,
    pub p99_ns: [u64; PHASES],
}

impl Report {
    pub fn collect(engine: &'static str, threads: u32, wall: Duration, summary: &Summary) -> Self {
        let metrics = summary.report();
        Self {
            engine,
            threads,
            wall,
            attempts: metrics.started,
            aborts: metrics.aborted,
            p99_ns: metrics.p99_ns,
        }
    }

    pub fn committed(&self) -> u64 {
        self.attempts.saturating_sub(self.aborts)
    }

    pub fn throughput(&self) -> f64 {
        self.committed() as f64 / self.wall.as_secs_f64()
    }

    pub fn abort_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.aborts as f64 * 100.0 / self.attempts as f64
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== Task Summary ({}) ====", self.engine)?;
        writeln!(f, "{:<24} {:>12} ms", "Test time", self.wall.as_millis())?;
        writeln!(f, "{:<24} {:>12}", "Worker threads", self.threads)?;
        writeln!(f, "{:<24} {:>12}", "Total tx", self.attempts)?;
        writeln!(f, "{:<24} {:>12}", "Abort tx", self.aborts)?;
        writeln!(f, "{:<24} {:>12.0} txn/s", "Speed", self.throughput())?;
        writeln!(f, "{:<24} {:>12.2} %", "Abort rate", self.abort_rate())?;
        for phase in ALL_PHASES {
            writeln!(
                f,
                "{:<24} {:>12} ns",
                format!("{} latency (p99)", phase.label()),
                self.p99_ns[phase as usize]
            )?;
        }
        Ok(())
    }
}
