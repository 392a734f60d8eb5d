use std::sync::atomic::{AtomicU64, Ordering};

use crate::MAX_WORKERS;

/// Global commit-timestamp counter. Monotonicity is the only guarantee.
pub struct Clock {
    counter: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Next fresh timestamp, starting from 1.
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker start-timestamp registers; the minimum over the live entries is
/// the version-reclamation watermark.
///
/// Each slot is written only by its owning worker and read by reclaimers. An
/// idle slot holds `u64::MAX`.
pub struct TsRegisters {
    slots: [AtomicU64; MAX_WORKERS],
}

impl TsRegisters {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(u64::MAX)),
        }
    }

    pub fn publish(&self, tid: u32, ts: u64) {
        self.slots[tid as usize].store(ts, Ordering::Release);
    }

    pub fn clear(&self, tid: u32) {
        self.slots[tid as usize].store(u64::MAX, Ordering::Release);
    }

    /// Minimum published start timestamp, or 0 when no worker is active.
    pub fn min(&self) -> u64 {
        let mut min = u64::MAX;
        for slot in &self.slots {
            min = min.min(slot.load(Ordering::Acquire));
        }
        if min == u64::MAX {
            0
        } else {
            min
        }
    }
}

impl Default for TsRegisters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotone() {
        let clock = Clock::new();
        assert_eq!(clock.next(), 1);
        assert_eq!(clock.next(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn watermark_over_live_registers() {
        let regs = TsRegisters::new();
        assert_eq!(regs.min(), 0);
        regs.publish(0, 17);
        regs.publish(3, 9);
        assert_eq!(regs.min(), 9);
        regs.clear(3);
        assert_eq!(regs.min(), 17);
    }
}
