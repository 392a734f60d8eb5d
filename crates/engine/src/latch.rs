use std::{
    hint,
    sync::atomic::{AtomicI32, Ordering},
};

const WRITER: i32 = -1;

/// Word-sized reader/writer latch embedded in tuple headers.
///
/// Counter semantics: `-1` write-locked, `0` free, `n > 0` means `n` readers.
/// There is no fairness and no waiting queue; contended paths either spin
/// with [`core::hint::spin_loop`] or give up and let the transaction abort.
#[repr(transparent)]
pub struct RwLatch {
    counter: AtomicI32,
}

impl RwLatch {
    pub const fn new() -> Self {
        Self {
            counter: AtomicI32::new(0),
        }
    }

    /// Reset to unlocked. Used when a header is (re-)initialized in place,
    /// e.g. during the recovery data phase where a crashed owner may have
    /// left the latch taken.
    pub fn init(&self) {
        self.counter.store(0, Ordering::Release);
    }

    pub fn try_read(&self) -> bool {
        let mut cur = self.counter.load(Ordering::Acquire);
        loop {
            if cur == WRITER {
                return false;
            }
            match self
                .counter
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn read(&self) {
        while !self.try_read() {
            hint::spin_loop();
        }
    }

    pub fn unlock_read(&self) {
        let prev = self.counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn try_write(&self) -> bool {
        self.counter
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn write(&self) {
        while !self.try_write() {
            hint::spin_loop();
        }
    }

    pub fn unlock_write(&self) {
        let prev = self.counter.swap(0, Ordering::AcqRel);
        debug_assert_eq!(prev, WRITER);
    }

    /// Upgrade a read latch held by the sole reader to a write latch.
    pub fn try_upgrade(&self) -> bool {
        self.counter
            .compare_exchange(1, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_write_locked(&self) -> bool {
        self.counter.load(Ordering::Acquire) == WRITER
    }
}

impl Default for RwLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_exclude_writer() {
        let latch = RwLatch::new();
        assert!(latch.try_read());
        assert!(latch.try_read());
        assert!(!latch.try_write());
        latch.unlock_read();
        assert!(!latch.try_write());
        latch.unlock_read();
        assert!(latch.try_write());
        assert!(!latch.try_read());
        assert!(latch.is_write_locked());
        latch.unlock_write();
        assert!(latch.try_read());
    }

    #[test]
    fn upgrade_only_for_sole_reader() {
        let latch = RwLatch::new();
        latch.read();
        latch.read();
        assert!(!latch.try_upgrade());
        latch.unlock_read();
        assert!(latch.try_upgrade());
        assert!(latch.is_write_locked());
        latch.unlock_write();
    }
}
