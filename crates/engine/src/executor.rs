use bytemuck::Pod;
use pmtx_pmem::Key;

use crate::ConcurrencyControl;

/// Operation surface a transaction runs against.
///
/// Implemented by [`Executor`]; workloads and recovery replay are written
/// against this trait so they stay engine-agnostic.
pub trait Execute {
    /// Copy `dst.len()` bytes of the record at `key` from `offset`.
    fn read_at(&mut self, key: Key, dst: &mut [u8], offset: u32) -> bool;

    /// Typed view of the record's first `size_of::<T>()` bytes. The
    /// reference borrows a transaction-private snapshot and is invalidated
    /// by the next executor call.
    fn read<T: Pod>(&mut self, key: Key) -> Option<&T>;

    /// Typed mutable view over the staged full-tuple image; edits are
    /// applied at commit.
    fn update<T: Pod>(&mut self, key: Key) -> Option<&mut T>;

    /// Stage an update of `[offset, offset + size)` and return the staged
    /// range for in-place editing.
    fn update_slice(&mut self, key: Key, size: u32, offset: u32) -> Option<&mut [u8]>;

    /// Stage an update overwriting `[offset, offset + src.len())` with `src`.
    fn update_at(&mut self, key: Key, src: &[u8], offset: u32) -> bool;

    fn insert(&mut self, key: Key, src: &[u8]) -> bool;

    fn remove(&mut self, key: Key) -> bool;

    fn commit(&mut self) -> bool;

    fn abort(&mut self) -> bool;

    /// Re-initialize for another run of the same transaction.
    fn reset(&mut self) -> bool;
}

/// Thin adapter translating typed calls into engine primitives.
///
/// One executor drives one transaction at a time; `reset` re-arms it after
/// an abort.
pub struct Executor<'a, C: ConcurrencyControl> {
    cc: &'a C,
    worker: &'a mut C::Worker,
    ctx: C::Context,
    scratch: Vec<u64>,
}

impl<'a, C: ConcurrencyControl> Executor<'a, C> {
    pub fn begin(cc: &'a C, worker: &'a mut C::Worker) -> Self {
        let mut ctx = C::Context::default();
        cc.begin(worker, &mut ctx);
        Self {
            cc,
            worker,
            ctx,
            scratch: Vec::new(),
        }
    }

    pub fn context(&self) -> &C::Context {
        &self.ctx
    }
}

impl<C: ConcurrencyControl> Execute for Executor<'_, C> {
    fn read_at(&mut self, key: Key, dst: &mut [u8], offset: u32) -> bool {
        self.cc.read_into(self.worker, &mut self.ctx, key, dst, offset)
    }

    fn read<T: Pod>(&mut self, key: Key) -> Option<&T> {
        let size = std::mem::size_of::<T>();
        debug_assert!(std::mem::align_of::<T>() <= 8);
        self.scratch.resize(size.div_ceil(8), 0);
        let bytes = &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.scratch)[..size];
        if !self.cc.read_into(self.worker, &mut self.ctx, key, bytes, 0) {
            return None;
        }
        Some(bytemuck::from_bytes(&bytemuck::cast_slice::<u64, u8>(&self.scratch)[..size]))
    }

    fn update<T: Pod>(&mut self, key: Key) -> Option<&mut T> {
        debug_assert!(std::mem::align_of::<T>() <= 8);
        let size = std::mem::size_of::<T>() as u32;
        let bytes = self.cc.update(self.worker, &mut self.ctx, key, size, 0)?;
        Some(bytemuck::from_bytes_mut(bytes))
    }

    fn update_slice(&mut self, key: Key, size: u32, offset: u32) -> Option<&mut [u8]> {
        self.cc.update(self.worker, &mut self.ctx, key, size, offset)
    }

    fn update_at(&mut self, key: Key, src: &[u8], offset: u32) -> bool {
        match self.cc.update(self.worker, &mut self.ctx, key, src.len() as u32, offset) {
            Some(staged) => {
                staged.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, key: Key, src: &[u8]) -> bool {
        self.cc.insert(self.worker, &mut self.ctx, key, src)
    }

    fn remove(&mut self, key: Key) -> bool {
        self.cc.remove(self.worker, &mut self.ctx, key)
    }

    fn commit(&mut self) -> bool {
        self.cc.commit(self.worker, &mut self.ctx)
    }

    fn abort(&mut self) -> bool {
        self.cc.abort(self.worker, &mut self.ctx)
    }

    fn reset(&mut self) -> bool {
        self.cc.reset(self.worker, &mut self.ctx)
    }
}
