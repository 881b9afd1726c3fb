use arrayvec::ArrayVec;
use sluice_core::{util::mix_into, MAX_PORTS};

use crate::graph::ResourceFault;

/// The index of a buffer in a [`BufferArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferIdx(pub(crate) u32);

impl BufferIdx {
    pub fn get(&self) -> usize {
        self.0 as usize
    }
}

/// Statistics about a [`BufferArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// The total number of buffers.
    pub capacity: usize,
    /// The length of each buffer in frames.
    pub buffer_len: usize,
    /// The number of buffers currently free.
    pub free: usize,
    /// The largest number of buffers that were in use at the same time
    /// since the last reset.
    pub peak_in_use: usize,
}

/// A fixed pool of equally sized sample buffers.
///
/// The buffers live in one contiguous allocation. Free buffers are tracked
/// by a stack of indices that is preallocated to the full capacity, so
/// acquiring and releasing buffers never allocates.
pub struct BufferArena {
    storage: Vec<f32>,
    buffer_len: usize,
    num_buffers: usize,
    free: Vec<u32>,
    peak_in_use: usize,
}

impl BufferArena {
    pub fn new(num_buffers: usize, buffer_len: usize) -> Self {
        assert!(num_buffers > 0);
        assert!(num_buffers < u32::MAX as usize);
        assert!(buffer_len > 0);

        let mut arena = Self {
            storage: vec![0.0; num_buffers * buffer_len],
            buffer_len,
            num_buffers,
            free: Vec::with_capacity(num_buffers),
            peak_in_use: 0,
        };
        arena.reset();
        arena
    }

    /// Mark every buffer as free.
    ///
    /// Buffers are handed out in ascending index order after a reset.
    pub fn reset(&mut self) {
        self.free.clear();
        self.free.extend((0..self.num_buffers as u32).rev());
        self.peak_in_use = 0;
    }

    /// Take a buffer out of the pool. Its contents are unspecified.
    pub fn acquire(&mut self) -> Result<BufferIdx, ResourceFault> {
        let Some(idx) = self.free.pop() else {
            return Err(ResourceFault {
                capacity: self.num_buffers,
            });
        };

        self.peak_in_use = self.peak_in_use.max(self.num_buffers - self.free.len());

        Ok(BufferIdx(idx))
    }

    /// Return a buffer to the pool.
    pub fn release(&mut self, buffer: BufferIdx) {
        debug_assert!((buffer.0 as usize) < self.num_buffers);
        debug_assert!(
            !self.free.contains(&buffer.0),
            "buffer {} released twice",
            buffer.0
        );

        self.free.push(buffer.0);
    }

    pub fn buffer(&self, buffer: BufferIdx, frames: usize) -> &[f32] {
        let start = buffer.get() * self.buffer_len;
        &self.storage[start..start + frames.min(self.buffer_len)]
    }

    pub fn buffer_mut(&mut self, buffer: BufferIdx, frames: usize) -> &mut [f32] {
        let start = buffer.get() * self.buffer_len;
        &mut self.storage[start..start + frames.min(self.buffer_len)]
    }

    /// Fill the first `frames` samples of a buffer with zeros.
    pub fn zero(&mut self, buffer: BufferIdx, frames: usize) {
        self.buffer_mut(buffer, frames).fill(0.0);
    }

    /// Copy the first `frames` samples of `src` into `dst`.
    pub fn copy(&mut self, src: BufferIdx, dst: BufferIdx, frames: usize) {
        if src == dst {
            return;
        }
        let (src, dst) = self.pair_mut(src, dst, frames);
        dst.copy_from_slice(src);
    }

    /// Add the first `frames` samples of `src` into `dst`.
    pub fn accumulate(&mut self, src: BufferIdx, dst: BufferIdx, frames: usize) {
        assert_ne!(src, dst);
        let (src, dst) = self.pair_mut(src, dst, frames);
        mix_into(dst, src);
    }

    fn pair_mut(&mut self, a: BufferIdx, b: BufferIdx, frames: usize) -> (&mut [f32], &mut [f32]) {
        let len = self.buffer_len;
        let frames = frames.min(len);

        if a.get() < b.get() {
            let (lo, hi) = self.storage.split_at_mut(b.get() * len);
            (
                &mut lo[a.get() * len..a.get() * len + frames],
                &mut hi[..frames],
            )
        } else {
            let (lo, hi) = self.storage.split_at_mut(a.get() * len);
            let b_start = b.get() * len;
            (&mut hi[..frames], &mut lo[b_start..b_start + frames])
        }
    }

    /// Borrow several distinct buffers mutably at once, each truncated to
    /// `frames` samples.
    pub fn buffers_mut(
        &mut self,
        buffers: &[BufferIdx],
        frames: usize,
    ) -> ArrayVec<&mut [f32], MAX_PORTS> {
        assert!(buffers.len() <= MAX_PORTS);
        let frames = frames.min(self.buffer_len);

        #[cfg(debug_assertions)]
        for (i, a) in buffers.iter().enumerate() {
            assert!(
                !buffers[i + 1..].contains(a),
                "buffer {} borrowed twice",
                a.0
            );
        }

        let len = self.buffer_len;
        let base = self.storage.as_mut_ptr();
        let mut out = ArrayVec::new();
        for b in buffers.iter() {
            assert!(b.get() < self.num_buffers);
            // SAFETY: Every index is in bounds and distinct, so the returned
            // slices never overlap. They borrow `self` mutably for their
            // whole lifetime.
            out.push(unsafe { std::slice::from_raw_parts_mut(base.add(b.get() * len), frames) });
        }
        out
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            capacity: self.num_buffers,
            buffer_len: self.buffer_len,
            free: self.free.len(),
            peak_in_use: self.peak_in_use,
        }
    }
}

impl std::fmt::Debug for BufferArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferArena")
            .field("stats", &self.stats())
            .finish()
    }
}
